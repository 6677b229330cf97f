//! Read-only access to the raw feed store
//!
//! Every entity has one feed table `feed_NNNNN (src, timestamp, price, volume)`
//! where `src` is the [`FeedSource`] code of the row. Daily trade limits live in
//! an optional `entity_limits (entity_id, daily_limit)` table.
//!
//! A missing feed table or a missing observation is not an error: lookups
//! zero-fill so the row computer stays total.

use super::error::{is_missing_table, PipelineError};
use super::types::{EntityId, RawObservation, GRID_STEP};
use crate::sqlite_pragma::apply_reader_pragmas;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

/// Name of the raw feed table for one entity
pub fn feed_table(entity: EntityId) -> String {
    format!("feed_{:05}", entity)
}

/// The six ways a feed can be queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedSource {
    /// Irregular reference price, latest point at or before the row
    Reference,
    FiveMinuteBuy,
    FiveMinuteSell,
    TradeBuy,
    TradeSell,
    /// Buy and sell prints together
    TradeMerged,
}

impl FeedSource {
    pub const ALL: [FeedSource; 6] = [
        FeedSource::Reference,
        FeedSource::FiveMinuteBuy,
        FeedSource::FiveMinuteSell,
        FeedSource::TradeBuy,
        FeedSource::TradeSell,
        FeedSource::TradeMerged,
    ];

    pub fn code(self) -> u8 {
        match self {
            FeedSource::Reference => 0,
            FeedSource::FiveMinuteBuy => 1,
            FeedSource::FiveMinuteSell => 2,
            FeedSource::TradeBuy => 3,
            FeedSource::TradeSell => 4,
            FeedSource::TradeMerged => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeedSource::Reference => "reference",
            FeedSource::FiveMinuteBuy => "5m-buy",
            FeedSource::FiveMinuteSell => "5m-sell",
            FeedSource::TradeBuy => "trade-buy",
            FeedSource::TradeSell => "trade-sell",
            FeedSource::TradeMerged => "trade-merged",
        }
    }

    /// Query this feed for one entity at one grid timestamp
    pub fn read(
        self,
        conn: &Connection,
        entity: EntityId,
        timestamp: i64,
    ) -> Result<RawObservation, PipelineError> {
        let table = feed_table(entity);

        let result = match self {
            FeedSource::Reference => read_reference(conn, &table, timestamp),
            FeedSource::FiveMinuteBuy | FeedSource::FiveMinuteSell => {
                read_aggregate(conn, &table, self.code(), timestamp)
            }
            FeedSource::TradeBuy => read_prints(conn, &table, "src = 3", timestamp),
            FeedSource::TradeSell => read_prints(conn, &table, "src = 4", timestamp),
            FeedSource::TradeMerged => read_prints(conn, &table, "src IN (3, 4)", timestamp),
        };

        match result {
            Ok(observation) => Ok(observation),
            Err(e) if is_missing_table(&e) => Ok(self.empty()),
            Err(e) => Err(e.into()),
        }
    }

    /// Zero-filled observation of this feed's shape
    pub fn empty(self) -> RawObservation {
        match self {
            FeedSource::Reference => RawObservation::Reference {
                price: 0,
                volume: 0,
                observed_at: 0,
            },
            FeedSource::FiveMinuteBuy | FeedSource::FiveMinuteSell => {
                RawObservation::Aggregate { price: 0, volume: 0 }
            }
            _ => RawObservation::Prints(Vec::new()),
        }
    }
}

fn read_reference(conn: &Connection, table: &str, timestamp: i64) -> rusqlite::Result<RawObservation> {
    let sql = format!(
        "SELECT price, volume, timestamp FROM \"{}\"
         WHERE src = 0 AND timestamp <= ?1
         ORDER BY timestamp DESC LIMIT 1",
        table
    );
    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![timestamp], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .optional()?;

    Ok(match row {
        Some((price, volume, observed_at)) => RawObservation::Reference {
            price: price.unwrap_or(0),
            volume: volume.unwrap_or(0),
            observed_at,
        },
        None => FeedSource::Reference.empty(),
    })
}

fn read_aggregate(conn: &Connection, table: &str, code: u8, timestamp: i64) -> rusqlite::Result<RawObservation> {
    let sql = format!(
        "SELECT price, volume FROM \"{}\" WHERE src = ?1 AND timestamp = ?2 LIMIT 1",
        table
    );
    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![code, timestamp], |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
        })
        .optional()?;

    let (price, volume) = row.unwrap_or((None, None));
    Ok(RawObservation::Aggregate {
        price: price.unwrap_or(0),
        volume: volume.unwrap_or(0),
    })
}

fn read_prints(conn: &Connection, table: &str, filter: &str, timestamp: i64) -> rusqlite::Result<RawObservation> {
    let sql = format!(
        "SELECT price FROM \"{}\"
         WHERE {} AND timestamp >= ?1 AND timestamp < ?2 AND price IS NOT NULL
         ORDER BY price",
        table, filter
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let prices = stmt
        .query_map(params![timestamp, timestamp + GRID_STEP], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(RawObservation::Prints(prices))
}

/// Read-only handle on the raw feed store. One per worker.
pub struct SourceReader {
    conn: Connection,
}

impl SourceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_reader_pragmas(&conn)?;

        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn read(
        &self,
        source: FeedSource,
        entity: EntityId,
        timestamp: i64,
    ) -> Result<RawObservation, PipelineError> {
        source.read(&self.conn, entity, timestamp)
    }

    /// Daily trade limit of an entity, 0 when unknown
    pub fn daily_limit(&self, entity: EntityId) -> Result<i64, PipelineError> {
        let result = self
            .conn
            .query_row(
                "SELECT daily_limit FROM entity_limits WHERE entity_id = ?1",
                params![entity],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional();

        match result {
            Ok(limit) => Ok(limit.flatten().unwrap_or(0)),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest 5-minute aggregate timestamp of an entity
    pub fn latest_five_minute(&self, entity: EntityId) -> Result<Option<i64>, PipelineError> {
        let sql = format!(
            "SELECT MAX(timestamp) FROM \"{}\" WHERE src IN (1, 2)",
            feed_table(entity)
        );

        match self.conn.query_row(&sql, [], |row| row.get::<_, Option<i64>>(0)) {
            Ok(ts) => Ok(ts),
            Err(e) if is_missing_table(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest 5-minute timestamp across a set of entities
    pub fn latest_five_minute_across(&self, entities: &[EntityId]) -> Result<Option<i64>, PipelineError> {
        let mut latest: Option<i64> = None;
        for &entity in entities {
            if let Some(ts) = self.latest_five_minute(entity)? {
                latest = Some(latest.map_or(ts, |l| l.max(ts)));
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::{feed_db, insert_feed, set_daily_limit};

    #[test]
    fn test_source_codes_are_closed() {
        for code in 0..6u8 {
            assert_eq!(FeedSource::from_code(code).unwrap().code(), code);
        }
        assert!(FeedSource::from_code(6).is_none());
    }

    #[test]
    fn test_reference_takes_latest_at_or_before() {
        let (_dir, path) = feed_db();
        insert_feed(&path, 2, 0, 1_000, 100, 5_000);
        insert_feed(&path, 2, 0, 2_000, 110, 6_000);
        insert_feed(&path, 2, 0, 3_000, 120, 7_000);

        let reader = SourceReader::open(&path).unwrap();

        assert_eq!(
            reader.read(FeedSource::Reference, 2, 2_000).unwrap(),
            RawObservation::Reference { price: 110, volume: 6_000, observed_at: 2_000 }
        );
        assert_eq!(
            reader.read(FeedSource::Reference, 2, 2_999).unwrap(),
            RawObservation::Reference { price: 110, volume: 6_000, observed_at: 2_000 }
        );
        assert_eq!(
            reader.read(FeedSource::Reference, 2, 999).unwrap(),
            FeedSource::Reference.empty()
        );
    }

    #[test]
    fn test_aggregates_match_exact_timestamp() {
        let (_dir, path) = feed_db();
        insert_feed(&path, 2, 1, 600, 95, 40);
        insert_feed(&path, 2, 2, 600, 105, 30);

        let reader = SourceReader::open(&path).unwrap();

        assert_eq!(
            reader.read(FeedSource::FiveMinuteBuy, 2, 600).unwrap(),
            RawObservation::Aggregate { price: 95, volume: 40 }
        );
        assert_eq!(
            reader.read(FeedSource::FiveMinuteSell, 2, 600).unwrap(),
            RawObservation::Aggregate { price: 105, volume: 30 }
        );
        assert_eq!(
            reader.read(FeedSource::FiveMinuteBuy, 2, 900).unwrap(),
            RawObservation::Aggregate { price: 0, volume: 0 }
        );
    }

    #[test]
    fn test_prints_bounded_and_ordered() {
        let (_dir, path) = feed_db();
        insert_feed(&path, 2, 3, 600, 101, 1);
        insert_feed(&path, 2, 4, 650, 99, 1);
        insert_feed(&path, 2, 3, 899, 97, 1);
        insert_feed(&path, 2, 3, 900, 500, 1); // next bucket
        insert_feed(&path, 2, 4, 599, 1, 1); // previous bucket

        let reader = SourceReader::open(&path).unwrap();

        assert_eq!(
            reader.read(FeedSource::TradeBuy, 2, 600).unwrap(),
            RawObservation::Prints(vec![97, 101])
        );
        assert_eq!(
            reader.read(FeedSource::TradeSell, 2, 600).unwrap(),
            RawObservation::Prints(vec![99])
        );
        assert_eq!(
            reader.read(FeedSource::TradeMerged, 2, 600).unwrap(),
            RawObservation::Prints(vec![97, 99, 101])
        );
    }

    #[test]
    fn test_missing_feed_table_zero_fills() {
        let (_dir, path) = feed_db();
        let reader = SourceReader::open(&path).unwrap();

        for source in FeedSource::ALL {
            assert_eq!(reader.read(source, 4151, 600).unwrap(), source.empty());
        }
        assert_eq!(reader.daily_limit(4151).unwrap(), 0);
        assert_eq!(reader.latest_five_minute(4151).unwrap(), None);
    }

    #[test]
    fn test_daily_limit_and_latest() {
        let (_dir, path) = feed_db();
        insert_feed(&path, 2, 1, 600, 95, 40);
        insert_feed(&path, 2, 2, 1_200, 105, 30);
        insert_feed(&path, 2, 0, 9_000, 100, 1);
        insert_feed(&path, 314, 1, 1_500, 10, 1);
        set_daily_limit(&path, 2, 11_000);

        let reader = SourceReader::open(&path).unwrap();

        assert_eq!(reader.daily_limit(2).unwrap(), 11_000);
        assert_eq!(reader.daily_limit(314).unwrap(), 0);
        assert_eq!(reader.latest_five_minute(2).unwrap(), Some(1_200));
        assert_eq!(reader.latest_five_minute_across(&[2, 314, 9]).unwrap(), Some(1_500));
    }
}
