//! Row, batch and feed types shared by the pipeline stages

use rusqlite::types::{ToSql, ToSqlOutput, Value};
use serde::{Deserialize, Serialize};

pub type EntityId = u32;

/// Spacing of the analytic grid in seconds
pub const GRID_STEP: i64 = 300;

/// Analytic row columns, in storage and staging order.
///
/// Columns whose name starts with `gap_` or contains `coefficient` are REAL,
/// every other column is INTEGER.
pub const ANALYTIC_COLUMNS: [&str; 37] = [
    "entity_id",
    "timestamp",
    "minute",
    "hour",
    "day",
    "month",
    "year",
    "weekday",
    "hour_bucket",
    "day_bucket",
    "week_bucket",
    "ref_timestamp",
    "ref_price",
    "ref_volume",
    "ref_value",
    "ref_volume_interval",
    "buy_price",
    "buy_volume",
    "buy_value",
    "sell_price",
    "sell_volume",
    "sell_value",
    "merged_price",
    "merged_volume",
    "merged_value",
    "merged_margin",
    "gap_sell_buy",
    "gap_buy_ref",
    "gap_sell_ref",
    "print_avg",
    "print_min",
    "print_max",
    "print_count",
    "print_margin",
    "tax",
    "est_volume_per_participant",
    "volume_coefficient",
];

/// Whether a column stores a ratio (REAL) rather than a count or price
pub fn is_real_column(name: &str) -> bool {
    name.starts_with("gap_") || name.contains("coefficient")
}

/// Name of the analytics table holding one entity's rows
pub fn entity_table(entity: EntityId) -> String {
    format!("entity_{:05}", entity)
}

/// Align a timestamp down to the analytic grid
pub fn align_to_grid(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(GRID_STEP)
}

/// A single bound value of a staged row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
}

impl SqlValue {
    pub fn zero_for(column: &str) -> Self {
        if is_real_column(column) {
            SqlValue::Real(0.0)
        } else {
            SqlValue::Integer(0)
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
        })
    }
}

/// One derived row for one entity at one grid timestamp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticRow {
    pub entity_id: EntityId,
    pub timestamp: i64,

    // Calendar decomposition (UTC)
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
    pub month: i64,
    pub year: i64,
    pub weekday: i64,
    pub hour_bucket: i64,
    pub day_bucket: i64,
    pub week_bucket: i64,

    // Reference feed
    pub ref_timestamp: i64,
    pub ref_price: i64,
    pub ref_volume: i64,
    pub ref_value: i64,
    pub ref_volume_interval: i64,

    // 5-minute feed
    pub buy_price: i64,
    pub buy_volume: i64,
    pub buy_value: i64,
    pub sell_price: i64,
    pub sell_volume: i64,
    pub sell_value: i64,
    pub merged_price: i64,
    pub merged_volume: i64,
    pub merged_value: i64,
    pub merged_margin: i64,

    pub gap_sell_buy: f64,
    pub gap_buy_ref: f64,
    pub gap_sell_ref: f64,

    // Trade prints
    pub print_avg: i64,
    pub print_min: i64,
    pub print_max: i64,
    pub print_count: i64,
    pub print_margin: i64,

    pub tax: i64,
    pub est_volume_per_participant: i64,
    pub volume_coefficient: f64,
}

impl AnalyticRow {
    /// Values in `ANALYTIC_COLUMNS` order
    pub fn to_values(&self) -> Vec<SqlValue> {
        use SqlValue::{Integer as I, Real as R};

        vec![
            I(i64::from(self.entity_id)),
            I(self.timestamp),
            I(self.minute),
            I(self.hour),
            I(self.day),
            I(self.month),
            I(self.year),
            I(self.weekday),
            I(self.hour_bucket),
            I(self.day_bucket),
            I(self.week_bucket),
            I(self.ref_timestamp),
            I(self.ref_price),
            I(self.ref_volume),
            I(self.ref_value),
            I(self.ref_volume_interval),
            I(self.buy_price),
            I(self.buy_volume),
            I(self.buy_value),
            I(self.sell_price),
            I(self.sell_volume),
            I(self.sell_value),
            I(self.merged_price),
            I(self.merged_volume),
            I(self.merged_value),
            I(self.merged_margin),
            R(self.gap_sell_buy),
            R(self.gap_buy_ref),
            R(self.gap_sell_ref),
            I(self.print_avg),
            I(self.print_min),
            I(self.print_max),
            I(self.print_count),
            I(self.print_margin),
            I(self.tax),
            I(self.est_volume_per_participant),
            R(self.volume_coefficient),
        ]
    }
}

/// Unit of transfer between a worker and the importer.
///
/// Rows are fixed-arity tuples in `ANALYTIC_COLUMNS` order with the entity id
/// in the first field, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub entity_id: EntityId,
    pub rows: Vec<Vec<SqlValue>>,
}

impl StagedBatch {
    pub fn from_rows(entity_id: EntityId, rows: &[AnalyticRow]) -> Self {
        Self {
            entity_id,
            rows: rows.iter().map(AnalyticRow::to_values).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A raw observation as returned by the source reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawObservation {
    /// Latest reference point at or before the query timestamp
    Reference { price: i64, volume: i64, observed_at: i64 },
    /// Exact 5-minute aggregate
    Aggregate { price: i64, volume: i64 },
    /// Trade prints in the 5-minute bucket, ascending by price
    Prints(Vec<i64>),
}
