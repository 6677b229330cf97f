//! Shared run progress
//!
//! Created by the coordinator at start and shared with workers and the
//! importer through `Arc`. Only atomic counters, no locks.

use super::error::PipelineError;
use super::types::EntityId;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Summary a worker returns when it stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub index: usize,
    pub entities_done: usize,
    pub rows_computed: u64,
    pub batches_staged: u64,
    /// Stopped early because cancellation was requested
    pub cancelled: bool,
}

/// Callbacks a worker invokes as it progresses
pub trait WorkerListener: Send + Sync {
    fn entity_done(&self, worker: usize, entity: EntityId, rows: usize);

    fn worker_completed(&self, report: &WorkerReport);

    fn worker_failed(&self, worker: usize, error: &PipelineError);
}

#[derive(Debug, Default)]
pub struct PipelineProgress {
    entities_remaining: AtomicUsize,
    active_workers: AtomicUsize,
    failed_workers: AtomicUsize,
    rows_computed: AtomicU64,
    rows_applied: AtomicU64,
    batches_applied: AtomicU64,
    importer_active: AtomicBool,
}

impl PipelineProgress {
    pub fn new(entities: usize, workers: usize) -> Self {
        Self {
            entities_remaining: AtomicUsize::new(entities),
            active_workers: AtomicUsize::new(workers),
            importer_active: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn entities_remaining(&self) -> usize {
        self.entities_remaining.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn failed_workers(&self) -> usize {
        self.failed_workers.load(Ordering::SeqCst)
    }

    pub fn rows_computed(&self) -> u64 {
        self.rows_computed.load(Ordering::Relaxed)
    }

    pub fn rows_applied(&self) -> u64 {
        self.rows_applied.load(Ordering::Relaxed)
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::Relaxed)
    }

    pub fn record_batch_applied(&self, rows: usize) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.rows_applied.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn importer_active(&self) -> bool {
        self.importer_active.load(Ordering::SeqCst)
    }

    pub fn set_importer_inactive(&self) {
        self.importer_active.store(false, Ordering::SeqCst);
    }

    fn release_worker(&self) {
        // Saturating at zero
        let _ = self
            .active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl WorkerListener for PipelineProgress {
    fn entity_done(&self, worker: usize, entity: EntityId, rows: usize) {
        let _ = self
            .entities_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.rows_computed.fetch_add(rows as u64, Ordering::Relaxed);
        log::debug!("✅ Worker {} finished entity {} ({} rows)", worker, entity, rows);
    }

    fn worker_completed(&self, report: &WorkerReport) {
        self.release_worker();
        log::info!(
            "🏁 Worker {} done: {} entities, {} rows, {} batches{}",
            report.index,
            report.entities_done,
            report.rows_computed,
            report.batches_staged,
            if report.cancelled { " (cancelled)" } else { "" }
        );
    }

    fn worker_failed(&self, worker: usize, error: &PipelineError) {
        self.failed_workers.fetch_add(1, Ordering::SeqCst);
        self.release_worker();
        log::error!("❌ Worker {} failed: {}", worker, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts_down() {
        let progress = PipelineProgress::new(3, 2);
        assert!(progress.importer_active());

        progress.entity_done(0, 2, 10);
        progress.entity_done(1, 13190, 5);
        assert_eq!(progress.entities_remaining(), 1);
        assert_eq!(progress.rows_computed(), 15);

        progress.worker_completed(&WorkerReport { index: 0, ..Default::default() });
        progress.worker_failed(1, &PipelineError::WorkerPanicked(1));
        assert_eq!(progress.active_workers(), 0);
        assert_eq!(progress.failed_workers(), 1);

        // Never wraps below zero
        progress.worker_completed(&WorkerReport::default());
        assert_eq!(progress.active_workers(), 0);

        progress.set_importer_inactive();
        assert!(!progress.importer_active());
    }
}
