//! Test helpers for building throwaway feed and analytics stores

use super::source::feed_table;
use super::types::EntityId;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

/// Empty feed store on disk; keep the `TempDir` alive for the test's duration
pub fn feed_db() -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("timeseries.db");
    Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE IF NOT EXISTS meta (k TEXT)")
        .unwrap();
    (dir, path)
}

pub fn insert_feed(path: &Path, entity: EntityId, src: u8, timestamp: i64, price: i64, volume: i64) {
    let conn = Connection::open(path).unwrap();
    let table = feed_table(entity);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                src INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                price INTEGER,
                volume INTEGER
            )",
            table
        ),
        [],
    )
    .unwrap();
    conn.execute(
        &format!("INSERT INTO \"{}\" (src, timestamp, price, volume) VALUES (?1, ?2, ?3, ?4)", table),
        params![src, timestamp, price, volume],
    )
    .unwrap();
}

pub fn set_daily_limit(path: &Path, entity: EntityId, limit: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_limits (entity_id INTEGER PRIMARY KEY, daily_limit INTEGER)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT OR REPLACE INTO entity_limits (entity_id, daily_limit) VALUES (?1, ?2)",
        params![entity, limit],
    )
    .unwrap();
}

/// Populate one entity with a buy/sell aggregate on every grid step of `[from, to)`
pub fn fill_five_minute(path: &Path, entity: EntityId, from: i64, to: i64) {
    let mut ts = from;
    while ts < to {
        insert_feed(path, entity, 1, ts, 100, 10);
        insert_feed(path, entity, 2, ts, 110, 12);
        ts += super::types::GRID_STEP;
    }
}

pub fn row_count(path: &Path, table: &str) -> i64 {
    Connection::open(path)
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| row.get(0))
        .unwrap()
}
