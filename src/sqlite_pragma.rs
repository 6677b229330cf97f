//! Connection tuning shared by every analytics-store connection.

use rusqlite::Connection;
use std::time::Duration;

/// Busy timeout applied to writer connections.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL, NORMAL sync, in-memory temp storage, mmap, a larger page cache
/// and a 1000-page autocheckpoint.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("⚠️  journal_mode stayed at {} (WAL unavailable)", mode);
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}

/// Pragmas for read-only feed connections.
pub fn apply_reader_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "query_only", true)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}
