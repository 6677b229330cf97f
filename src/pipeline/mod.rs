//! # Catch-up analytics pipeline
//!
//! Materializes one analytic row per tracked entity per 5-minute step,
//! merging three raw feeds (reference, 5-minute aggregates, trade prints),
//! for a rolling retention window.
//!
//! ## Flow
//!
//! ```text
//!  feed store (read-only)
//!        │
//!   SourceReader ──► RowComputer          CatchUpPlanner ──► SchemaManager
//!        │                                     │  (create tables, evict)
//!   ComputationWorker × N ◄── CatchUpPlan ◄────┘
//!        │  StagedBatch
//!   StagingSink ══ channel / batch files ══ StagingSource
//!                                                │
//!                                          Importer (single writer)
//!                                                │
//!                                       analytics store
//! ```
//!
//! Workers are partitioned by `entity_id % N` and share nothing but the
//! handoff. The importer is the only writer; eviction happens during
//! planning and compaction after the importer has gone inactive, so neither
//! ever overlaps an import.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod importer;
pub mod planner;
pub mod row;
pub mod schema;
pub mod source;
pub mod staging;
pub mod state;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::{HandoffBackend, PipelineConfig, WindowConfig};
pub use coordinator::{Pipeline, PipelineReport};
pub use error::{HandoffError, PipelineError};
pub use planner::{CatchUpPlan, CatchUpPlanner, CatchUpWindow, PlanDecision};
pub use row::{derive_row, FeedSnapshot, RowComputer};
pub use schema::{CompactionOutcome, CoverageMark, SchemaManager};
pub use source::{FeedSource, SourceReader};
pub use types::{AnalyticRow, EntityId, SqlValue, StagedBatch, ANALYTIC_COLUMNS, GRID_STEP};
