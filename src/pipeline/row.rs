//! Merge the three feeds for one grid timestamp into an [`AnalyticRow`]

use super::error::PipelineError;
use super::source::{FeedSource, SourceReader};
use super::types::{AnalyticRow, EntityId, RawObservation};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;

/// 5-minute intervals per day, used to spread the daily reference volume
const INTERVALS_PER_DAY: i64 = 288;

/// Everything the row derivation needs for one entity at one timestamp
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub ref_price: i64,
    pub ref_volume: i64,
    pub ref_timestamp: i64,
    pub buy_price: i64,
    pub buy_volume: i64,
    pub sell_price: i64,
    pub sell_volume: i64,
    /// Buy and sell prints, ascending by price
    pub prints: Vec<i64>,
    pub daily_limit: i64,
}

impl FeedSnapshot {
    fn apply(&mut self, source: FeedSource, observation: RawObservation) {
        match (source, observation) {
            (FeedSource::Reference, RawObservation::Reference { price, volume, observed_at }) => {
                self.ref_price = price;
                self.ref_volume = volume;
                self.ref_timestamp = observed_at;
            }
            (FeedSource::FiveMinuteBuy, RawObservation::Aggregate { price, volume }) => {
                self.buy_price = price;
                self.buy_volume = volume;
            }
            (FeedSource::FiveMinuteSell, RawObservation::Aggregate { price, volume }) => {
                self.sell_price = price;
                self.sell_volume = volume;
            }
            (_, RawObservation::Prints(prices)) => self.prints = prices,
            (source, other) => {
                log::warn!("⚠️  Unexpected {:?} observation from {} feed", other, source.as_str());
            }
        }
    }
}

/// Derive an analytic row from a feed snapshot. Pure and total.
pub fn derive_row(entity: EntityId, timestamp: i64, feeds: &FeedSnapshot) -> AnalyticRow {
    let mut row = AnalyticRow {
        entity_id: entity,
        timestamp,
        ..Default::default()
    };

    if let Some(dt) = DateTime::<Utc>::from_timestamp(timestamp, 0) {
        row.minute = i64::from(dt.minute());
        row.hour = i64::from(dt.hour());
        row.day = i64::from(dt.day());
        row.month = i64::from(dt.month());
        row.year = i64::from(dt.year());
        row.weekday = i64::from(dt.weekday().num_days_from_monday());
    }
    row.hour_bucket = timestamp.div_euclid(3_600);
    row.day_bucket = timestamp.div_euclid(86_400);
    row.week_bucket = timestamp.div_euclid(604_800);

    let (w, b, s) = (feeds.ref_price, feeds.buy_price, feeds.sell_price);

    row.ref_timestamp = feeds.ref_timestamp;
    row.ref_price = w;
    row.ref_volume = feeds.ref_volume;
    row.ref_value = w.saturating_mul(feeds.ref_volume);
    row.ref_volume_interval = feeds.ref_volume / INTERVALS_PER_DAY;

    row.buy_price = b;
    row.buy_volume = feeds.buy_volume;
    row.buy_value = b.saturating_mul(feeds.buy_volume);
    row.sell_price = s;
    row.sell_volume = feeds.sell_volume;
    row.sell_value = s.saturating_mul(feeds.sell_volume);

    row.merged_price = if b > 0 && s > 0 { (b + s) / 2 } else { b.max(s) };
    row.merged_volume = feeds.buy_volume + feeds.sell_volume;
    row.merged_value = row.merged_price.saturating_mul(row.merged_volume);

    match (feeds.prints.first(), feeds.prints.last()) {
        (Some(&min), Some(&max)) => {
            let count = feeds.prints.len() as i64;
            let sum: i64 = feeds.prints.iter().sum();
            row.print_min = min;
            row.print_max = max;
            row.print_count = count;
            row.print_avg = sum / count;
            row.tax = tax_on_total(sum, count);
            row.print_margin = max - min - row.tax;
        }
        _ => {
            // Literal fallback: largest of the three prices
            row.tax = tax_on_total(s.max(b).max(w), 1);
        }
    }

    row.merged_margin = if b.min(s) != 0 { s - b - row.tax } else { 0 };

    if w != 0 {
        let ref_price = w as f64;
        row.gap_sell_buy = (s - b) as f64 / ref_price;
        row.gap_buy_ref = (b - w) as f64 / ref_price;
        row.gap_sell_ref = (s - w) as f64 / ref_price;
    }

    let limit = feeds.daily_limit;
    row.est_volume_per_participant = (4 * limit).min(feeds.ref_volume / 10);
    row.volume_coefficient = limit.min(feeds.ref_volume) as f64 / limit.max(1) as f64;

    row
}

/// floor(0.01 * total / count) without float rounding
fn tax_on_total(total: i64, count: i64) -> i64 {
    total.div_euclid(100 * count.max(1))
}

/// Reads the feeds for one entity/timestamp and derives the row
pub struct RowComputer {
    reader: SourceReader,
    limits: HashMap<EntityId, i64>,
}

impl RowComputer {
    pub fn new(reader: SourceReader) -> Self {
        Self {
            reader,
            limits: HashMap::new(),
        }
    }

    pub fn snapshot(&mut self, entity: EntityId, timestamp: i64) -> Result<FeedSnapshot, PipelineError> {
        let daily_limit = match self.limits.get(&entity) {
            Some(&limit) => limit,
            None => {
                let limit = self.reader.daily_limit(entity)?;
                self.limits.insert(entity, limit);
                limit
            }
        };

        let mut snapshot = FeedSnapshot {
            daily_limit,
            ..Default::default()
        };
        for source in [
            FeedSource::Reference,
            FeedSource::FiveMinuteBuy,
            FeedSource::FiveMinuteSell,
            FeedSource::TradeMerged,
        ] {
            let observation = self.reader.read(source, entity, timestamp)?;
            snapshot.apply(source, observation);
        }

        Ok(snapshot)
    }

    pub fn compute(&mut self, entity: EntityId, timestamp: i64) -> Result<AnalyticRow, PipelineError> {
        let snapshot = self.snapshot(entity, timestamp)?;
        Ok(derive_row(entity, timestamp, &snapshot))
    }
}
