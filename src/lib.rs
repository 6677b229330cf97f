//! itemflow: incremental analytics materialization for item price feeds.
//!
//! Reads raw reference, 5-minute and trade-print observations from a
//! timeseries store and maintains one derived analytic row per entity per
//! 5-minute step in a separate analytics store.

pub mod pipeline;
pub mod sqlite_pragma;
