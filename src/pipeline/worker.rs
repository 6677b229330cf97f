//! Computation workers
//!
//! Each worker owns the entities with `entity_id % workers == index`, walks
//! their grid from the planned resume point up to `t1`, and stages rows in
//! ascending timestamp order. Workers only read the feed store; they never
//! touch the analytics store.

use super::error::PipelineError;
use super::planner::CatchUpPlan;
use super::row::RowComputer;
use super::source::SourceReader;
use super::staging::StagingSink;
use super::state::{WorkerListener, WorkerReport};
use super::types::{AnalyticRow, EntityId, StagedBatch};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entities owned by worker `index` out of `workers`
pub fn partition(entities: &[EntityId], workers: usize, index: usize) -> Vec<EntityId> {
    let workers = workers.max(1);
    entities
        .iter()
        .copied()
        .filter(|&entity| entity as usize % workers == index)
        .collect()
}

/// Reports the worker as failed if it unwinds before finishing
struct UnwindGuard {
    listener: Arc<dyn WorkerListener>,
    index: usize,
    armed: bool,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if self.armed {
            self.listener
                .worker_failed(self.index, &PipelineError::WorkerPanicked(self.index));
        }
    }
}

pub struct ComputationWorker {
    index: usize,
    entities: Vec<EntityId>,
    plan: Arc<CatchUpPlan>,
    source_path: PathBuf,
    sink: Box<dyn StagingSink>,
    flush_threshold: usize,
    cancel: CancellationToken,
    listener: Arc<dyn WorkerListener>,
}

impl ComputationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        entities: Vec<EntityId>,
        plan: Arc<CatchUpPlan>,
        source_path: impl Into<PathBuf>,
        sink: Box<dyn StagingSink>,
        flush_threshold: usize,
        cancel: CancellationToken,
        listener: Arc<dyn WorkerListener>,
    ) -> Self {
        Self {
            index,
            entities,
            plan,
            source_path: source_path.into(),
            sink,
            flush_threshold: flush_threshold.max(1),
            cancel,
            listener,
        }
    }

    /// Blocking. Run on a dedicated thread (`spawn_blocking`).
    pub fn run(mut self) -> WorkerReport {
        let mut guard = UnwindGuard {
            listener: Arc::clone(&self.listener),
            index: self.index,
            armed: true,
        };
        let mut report = WorkerReport {
            index: self.index,
            ..Default::default()
        };

        log::info!(
            "🔨 Worker {} starting: {} entities via {} handoff",
            self.index,
            self.entities.len(),
            self.sink.backend_type()
        );

        match self.run_entities(&mut report) {
            Ok(()) => self.listener.worker_completed(&report),
            Err(e) => self.listener.worker_failed(self.index, &e),
        }
        guard.armed = false;

        report
    }

    fn run_entities(&mut self, report: &mut WorkerReport) -> Result<(), PipelineError> {
        let mut computer = RowComputer::new(SourceReader::open(&self.source_path)?);
        let entities = std::mem::take(&mut self.entities);

        for entity in entities {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let resume_from = match self.plan.resume_point(entity) {
                Some(ts) => ts,
                None => continue,
            };

            let rows = self.process_entity(&mut computer, entity, resume_from, report)?;
            if report.cancelled {
                break;
            }
            report.entities_done += 1;
            self.listener.entity_done(self.index, entity, rows);
        }

        Ok(())
    }

    fn process_entity(
        &mut self,
        computer: &mut RowComputer,
        entity: EntityId,
        resume_from: i64,
        report: &mut WorkerReport,
    ) -> Result<usize, PipelineError> {
        let window = self.plan.window;
        let mut buffer: Vec<AnalyticRow> = Vec::with_capacity(self.flush_threshold.min(4_096));
        let mut rows = 0;

        for ts in window.grid_from(resume_from) {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            buffer.push(computer.compute(entity, ts)?);
            rows += 1;

            if buffer.len() >= self.flush_threshold {
                self.flush(entity, &mut buffer, report)?;
            }
        }
        // Entity boundary: never mix entities in one batch
        self.flush(entity, &mut buffer, report)?;

        report.rows_computed += rows as u64;
        Ok(rows)
    }

    fn flush(
        &mut self,
        entity: EntityId,
        buffer: &mut Vec<AnalyticRow>,
        report: &mut WorkerReport,
    ) -> Result<(), PipelineError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let batch = StagedBatch::from_rows(entity, buffer);
        log::debug!(
            "💾 Worker {} flushing {} rows of entity {}",
            self.index,
            batch.len(),
            entity
        );
        self.sink.stage(batch)?;
        report.batches_staged += 1;
        buffer.clear();

        Ok(())
    }
}
