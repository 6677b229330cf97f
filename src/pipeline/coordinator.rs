//! Pipeline coordinator
//!
//! One catch-up pass:
//! 1. Resolve the window and plan every tracked entity (tables are created
//!    and expired rows evicted here, before any import starts)
//! 2. Start the importer and N blocking workers
//! 3. Log progress on an interval until the importer goes inactive
//! 4. Optionally compact the store, then report

use super::config::PipelineConfig;
use super::error::PipelineError;
use super::importer::{ImportReport, Importer};
use super::planner::{resolve_window, CatchUpPlanner, CatchUpWindow};
use super::schema::{CompactionOutcome, SchemaManager};
use super::source::SourceReader;
use super::staging::{build_handoff, list_batch_files, Handoff};
use super::state::{PipelineProgress, WorkerListener, WorkerReport};
use super::worker::{partition, ComputationWorker};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Terminal summary of one run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub window: CatchUpWindow,
    pub entities_tracked: usize,
    pub entities_skipped: usize,
    pub entities_to_do: usize,
    pub entities_completed: usize,
    pub tables_created: usize,
    pub rows_computed: u64,
    pub rows_inserted: u64,
    pub rows_applied: u64,
    pub rows_failed: u64,
    pub rows_evicted: u64,
    pub batches_pending: usize,
    pub batches_retained: u64,
    pub workers_failed: usize,
    pub cancelled: bool,
    pub compaction: Option<CompactionOutcome>,
    pub elapsed: Duration,
}

impl std::fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Catch-up [{}, {}) in {:.1}s", self.window.t0, self.window.t1, self.elapsed.as_secs_f64())?;
        writeln!(f, "  entities skipped:   {}", self.entities_skipped)?;
        writeln!(f, "  tables created:     {}", self.tables_created)?;
        writeln!(f, "  entities completed: {}/{}", self.entities_completed, self.entities_to_do)?;
        writeln!(f, "  rows inserted:      {} ({} upserts)", self.rows_inserted, self.rows_applied)?;
        writeln!(f, "  rows evicted:       {}", self.rows_evicted)?;
        writeln!(f, "  rows failed:        {}", self.rows_failed)?;
        write!(
            f,
            "  files pending:      {} ({} retained)",
            self.batches_pending, self.batches_retained
        )?;
        if self.workers_failed > 0 {
            write!(f, "\n  workers failed:     {}", self.workers_failed)?;
        }
        if let Some(outcome) = &self.compaction {
            write!(f, "\n  compaction:         {:?}", outcome)?;
        }
        Ok(())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops workers between timestamps when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        log::info!("🛑 Stop requested");
        self.cancel.cancel();
    }

    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let config = &self.config;
        config.validate()?;

        log::info!("🚀 Catch-up pipeline starting");
        log::info!("   ├─ Source: {}", config.source_db_path.display());
        log::info!("   ├─ Analytics: {}", config.analytics_db_path.display());
        log::info!("   ├─ Tracked entities: {}", config.tracked_entities.len());
        log::info!("   ├─ Workers: {}", config.worker_count);
        log::info!("   └─ Handoff: {}", config.handoff_backend.as_str());

        // Plan (and evict) before the importer owns the store
        let window = {
            let reader = SourceReader::open(&config.source_db_path)?;
            resolve_window(&reader, &config.liquid_entities, &config.tracked_entities, &config.window)?
        };
        let schema = SchemaManager::open(&config.analytics_db_path)?;
        let plan = CatchUpPlanner::new(&schema, config.eviction_min_rows)
            .plan(window, &config.tracked_entities)?;
        let plan = Arc::new(plan);
        let to_do = plan.to_do();
        log::info!("📐 {} grid rows to compute", plan.pending_rows());

        let Handoff { sinks, source } = build_handoff(
            config.handoff_backend,
            &config.staging_dir,
            config.worker_count,
            config.channel_capacity,
            config.importer_poll_interval,
        )?;

        let progress = Arc::new(PipelineProgress::new(to_do.len(), config.worker_count));

        let importer = Importer::new(schema).with_retention_cutoff(window.t0);
        let mut importer_handle = tokio::spawn(importer.run(
            source,
            Arc::clone(&progress),
            self.cancel.clone(),
            config.importer_min_runtime,
        ));

        let workers: Vec<JoinHandle<WorkerReport>> = sinks
            .into_iter()
            .enumerate()
            .map(|(index, sink)| {
                let worker = ComputationWorker::new(
                    index,
                    partition(&to_do, config.worker_count, index),
                    Arc::clone(&plan),
                    config.source_db_path.clone(),
                    sink,
                    config.flush_threshold,
                    self.cancel.clone(),
                    Arc::clone(&progress) as Arc<dyn WorkerListener>,
                );
                tokio::task::spawn_blocking(move || worker.run())
            })
            .collect();

        let mut status = interval(config.status_interval);
        status.tick().await;
        let joined = loop {
            tokio::select! {
                _ = status.tick() => {
                    log::info!(
                        "📊 {} entities left, {} workers active, {} rows computed, {} rows applied",
                        progress.entities_remaining(),
                        progress.active_workers(),
                        progress.rows_computed(),
                        progress.rows_applied()
                    );
                }
                joined = &mut importer_handle => break joined,
            }
        };

        let mut worker_reports = Vec::with_capacity(workers.len());
        for (index, handle) in workers.into_iter().enumerate() {
            match handle.await {
                Ok(report) => worker_reports.push(report),
                Err(e) => log::error!("❌ Worker {} did not join: {}", index, e),
            }
        }

        let (importer, import_result) = joined?;
        if let Err(e) = &import_result {
            log::error!("❌ Importer stopped with error: {}", e);
        }
        let import_report: ImportReport = importer.report().clone();

        let compaction = if config.compact_after_run && import_result.is_ok() && !progress.importer_active() {
            match importer
                .into_schema()
                .compact(config.compaction_temp_path.as_deref())
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    log::error!("❌ Compaction failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let batches_pending = pending_batch_files(&config.staging_dir);

        import_result?;

        let report = PipelineReport {
            window,
            entities_tracked: config.tracked_entities.len(),
            entities_skipped: plan.skipped(),
            entities_to_do: to_do.len(),
            entities_completed: worker_reports.iter().map(|r| r.entities_done).sum(),
            tables_created: plan.created(),
            rows_computed: progress.rows_computed(),
            rows_inserted: import_report.rows_inserted,
            rows_applied: import_report.rows_applied,
            rows_failed: import_report.rows_failed,
            rows_evicted: plan.evicted(),
            batches_pending,
            batches_retained: import_report.batches_retained,
            workers_failed: progress.failed_workers(),
            cancelled: self.cancel.is_cancelled(),
            compaction,
            elapsed: started.elapsed(),
        };

        log::info!("🏁 Catch-up finished in {:.1}s", report.elapsed.as_secs_f64());
        log::info!("   ├─ Skipped: {}", report.entities_skipped);
        log::info!("   ├─ Created: {}", report.tables_created);
        log::info!("   ├─ Inserted: {}", report.rows_inserted);
        log::info!("   ├─ Evicted: {}", report.rows_evicted);
        log::info!("   └─ Files pending: {}", report.batches_pending);

        Ok(report)
    }
}

/// Batch files left in the staging dir after the run (retained ones included)
fn pending_batch_files(dir: &std::path::Path) -> usize {
    match list_batch_files(dir) {
        Ok(files) => files.len(),
        Err(e) => {
            log::warn!("⚠️  Could not list staging dir: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::HandoffBackend;
    use crate::pipeline::fixtures::{feed_db, fill_five_minute, row_count};
    use tempfile::tempdir;

    fn config(source: &std::path::Path, work: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            source_db_path: source.to_path_buf(),
            analytics_db_path: work.join("analytics.db"),
            staging_dir: work.join("staging"),
            tracked_entities: vec![2, 13190],
            liquid_entities: vec![2],
            worker_count: 2,
            importer_min_runtime: Duration::ZERO,
            importer_poll_interval: Duration::from_millis(20),
            status_interval: Duration::from_millis(50),
            flush_threshold: 50,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_fills_tracked_entities() {
        let (_feeds, source) = feed_db();
        // Latest aggregate at 176_400, already on an hour boundary
        fill_five_minute(&source, 2, 172_800, 176_700);

        let work = tempdir().unwrap();
        let mut config = config(&source, work.path());
        config.window.retention_days = 1;
        config.handoff_backend = HandoffBackend::File;

        let report = Pipeline::new(config.clone()).run().await.unwrap();

        assert_eq!(report.window, CatchUpWindow { t0: 86_400, t1: 176_400 });
        assert_eq!(report.tables_created, 2);
        assert_eq!(report.entities_completed, 2);
        assert_eq!(report.rows_inserted, 2 * 300);
        assert_eq!(report.batches_pending, 0);
        assert_eq!(row_count(&config.analytics_db_path, "entity_00002"), 300);
        assert_eq!(row_count(&config.analytics_db_path, "entity_13190"), 300);

        // Second run has nothing left to do
        let again = Pipeline::new(config).run().await.unwrap();
        assert_eq!(again.entities_skipped, 2);
        assert_eq!(again.rows_inserted, 0);
        assert!(again.to_string().contains("entities skipped:   2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_compacts_when_configured() {
        let (_feeds, source) = feed_db();
        fill_five_minute(&source, 2, 172_800, 176_700);

        let work = tempdir().unwrap();
        let mut config = config(&source, work.path());
        config.window.retention_days = 1;
        config.compact_after_run = true;

        let report = Pipeline::new(config.clone()).run().await.unwrap();

        assert!(matches!(report.compaction, Some(CompactionOutcome::Compacted { .. })));
        assert!(!work.path().join("analytics.db.compact.tmp").exists());
        assert_eq!(row_count(&config.analytics_db_path, "entity_00002"), 300);
        assert_eq!(row_count(&config.analytics_db_path, "entity_13190"), 300);
    }

    #[tokio::test]
    async fn test_run_without_source_data_fails() {
        let (_feeds, source) = feed_db();
        let work = tempdir().unwrap();

        let result = Pipeline::new(config(&source, work.path())).run().await;
        assert!(matches!(result, Err(PipelineError::NoSourceData)));
    }
}
