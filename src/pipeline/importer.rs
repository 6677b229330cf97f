//! Single-writer importer
//!
//! Drains staged batches into the analytics store. Each batch is applied in
//! one transaction with an idempotent `INSERT OR REPLACE` per row, so
//! re-importing a batch leaves the store unchanged.

use super::error::{is_missing_table, PipelineError};
use super::schema::{create_table_sql, SchemaManager};
use super::staging::{BatchOrigin, PendingBatch, StagingSource};
use super::state::PipelineProgress;
use super::types::{entity_table, EntityId, SqlValue, StagedBatch, ANALYTIC_COLUMNS};
use rusqlite::params_from_iter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What happened to the rows of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows upserted
    pub applied: usize,
    /// Rows that did not exist before this batch
    pub inserted: usize,
    pub failed: usize,
    /// Short rows completed with zeros
    pub padded: usize,
    /// Rows older than the retention cutoff, dropped
    pub expired: usize,
    pub table_created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub batches_applied: u64,
    /// Kept on disk and no longer offered
    pub batches_retained: u64,
    /// Dropped with unapplied rows because they could not be kept
    pub batches_lost: u64,
    pub rows_applied: u64,
    pub rows_inserted: u64,
    pub rows_failed: u64,
    pub rows_padded: u64,
    pub rows_expired: u64,
    pub tables_created: u64,
}

impl ImportReport {
    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.rows_applied += outcome.applied as u64;
        self.rows_inserted += outcome.inserted as u64;
        self.rows_failed += outcome.failed as u64;
        self.rows_padded += outcome.padded as u64;
        self.rows_expired += outcome.expired as u64;
        if outcome.table_created {
            self.tables_created += 1;
        }
    }
}

fn upsert_sql(entity: EntityId, columns: usize) -> String {
    let placeholders = (1..=columns)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT OR REPLACE INTO \"{}\" VALUES ({})",
        entity_table(entity),
        placeholders
    )
}

pub struct Importer {
    schema: SchemaManager,
    columns: HashMap<EntityId, usize>,
    expired_before: Option<i64>,
    report: ImportReport,
}

impl Importer {
    pub fn new(schema: SchemaManager) -> Self {
        Self {
            schema,
            columns: HashMap::new(),
            expired_before: None,
            report: ImportReport::default(),
        }
    }

    /// Drop staged rows older than `cutoff` instead of writing them back
    /// after eviction
    pub fn with_retention_cutoff(mut self, cutoff: i64) -> Self {
        self.expired_before = Some(cutoff);
        self
    }

    pub fn report(&self) -> &ImportReport {
        &self.report
    }

    /// Hand the store back, e.g. for compaction once importing is over
    pub fn into_schema(self) -> SchemaManager {
        self.schema
    }

    /// Ensure the table exists and return its column count
    fn prepare_entity(&mut self, entity: EntityId) -> Result<(usize, bool), PipelineError> {
        if let Some(&columns) = self.columns.get(&entity) {
            return Ok((columns, false));
        }
        let created = self.schema.ensure_table(entity)?;
        let columns = self.schema.column_count(entity)?;
        self.columns.insert(entity, columns);
        Ok((columns, created))
    }

    /// Apply every row of a batch in one transaction.
    ///
    /// Row-level failures are counted, not returned: the successful rows are
    /// still committed.
    pub fn apply_batch(&mut self, batch: &StagedBatch) -> Result<BatchOutcome, PipelineError> {
        let entity = batch.entity_id;
        let (columns, table_created) = self.prepare_entity(entity)?;
        let mut outcome = BatchOutcome {
            table_created,
            ..Default::default()
        };

        let before = self.schema.row_count(entity)?;
        let sql = upsert_sql(entity, columns);
        let cutoff = self.expired_before;

        let tx = self.schema.connection_mut().transaction()?;
        for row in &batch.rows {
            if let (Some(cutoff), Some(SqlValue::Integer(ts))) = (cutoff, row.get(1)) {
                if *ts < cutoff {
                    outcome.expired += 1;
                    continue;
                }
            }

            let mut values = row.clone();
            if values.len() > columns {
                log::warn!(
                    "⚠️  Row with {} values for {} columns in {}, skipping",
                    values.len(),
                    columns,
                    entity_table(entity)
                );
                outcome.failed += 1;
                continue;
            }
            if values.len() < columns {
                log::warn!(
                    "⚠️  Padding row with {} values to {} columns in {}",
                    values.len(),
                    columns,
                    entity_table(entity)
                );
                values.extend(
                    (values.len()..columns)
                        .map(|i| SqlValue::zero_for(ANALYTIC_COLUMNS.get(i).copied().unwrap_or(""))),
                );
                outcome.padded += 1;
            }

            let mut result = tx.execute(&sql, params_from_iter(values.iter()));
            if matches!(&result, Err(e) if is_missing_table(e)) {
                log::warn!("⚠️  {} vanished mid-import, recreating", entity_table(entity));
                tx.execute(&create_table_sql(entity), [])?;
                result = tx.execute(&sql, params_from_iter(values.iter()));
            }

            match result {
                Ok(_) => outcome.applied += 1,
                Err(e) => {
                    log::warn!("⚠️  Row rejected by {}: {}", entity_table(entity), e);
                    outcome.failed += 1;
                }
            }
        }
        tx.commit()?;

        let after = self.schema.row_count(entity)?;
        outcome.inserted = after.saturating_sub(before) as usize;
        self.report.absorb(&outcome);

        log::debug!(
            "📥 {}: {} applied, {} new, {} failed",
            entity_table(entity),
            outcome.applied,
            outcome.inserted,
            outcome.failed
        );
        Ok(outcome)
    }

    /// Poll the source once and settle every batch it returned.
    ///
    /// A lost batch does not stop the pass: the remaining batches are still
    /// settled and the first loss is returned afterwards.
    pub async fn drain_once(
        &mut self,
        source: &mut dyn StagingSource,
        progress: &PipelineProgress,
    ) -> Result<usize, PipelineError> {
        let batches = source.poll().await?;
        let count = batches.len();

        let mut lost = None;
        for pending in batches {
            if let Err(e) = self.settle(source, progress, pending) {
                lost.get_or_insert(e);
            }
        }

        match lost {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Apply one batch, then release or keep it. Errors only when a batch
    /// with unapplied rows could not be kept anywhere.
    fn settle(
        &mut self,
        source: &mut dyn StagingSource,
        progress: &PipelineProgress,
        pending: PendingBatch,
    ) -> Result<(), PipelineError> {
        let entity_id = pending.batch.entity_id;
        let rows = pending.batch.len();

        let complete = match self.apply_batch(&pending.batch) {
            Ok(outcome) => {
                progress.record_batch_applied(outcome.applied);
                if outcome.failed > 0 {
                    log::warn!(
                        "⚠️  Failed to insert {} of {} rows for entity {}",
                        outcome.failed,
                        rows,
                        entity_id
                    );
                }
                outcome.failed == 0
            }
            Err(e) => {
                log::error!("❌ Batch for entity {} not applied: {}", entity_id, e);
                self.report.rows_failed += rows as u64;
                false
            }
        };

        if complete {
            self.report.batches_applied += 1;
            if let Err(e) = source.acknowledge(pending) {
                log::warn!("⚠️  Batch for entity {} applied but not released: {}", entity_id, e);
            }
            return Ok(());
        }

        let in_memory = pending.origin == BatchOrigin::Memory;
        match source.retain(pending) {
            Ok(()) => Ok(()),
            Err(cause) if in_memory => {
                log::error!("❌ Could not keep failed batch for entity {}: {}", entity_id, cause);
                self.report.batches_lost += 1;
                Err(PipelineError::BatchLost { entity_id, rows, cause })
            }
            Err(e) => {
                log::warn!("⚠️  Failed batch file for entity {} left as is: {}", entity_id, e);
                Ok(())
            }
        }
    }

    /// Drain until no worker is active, nothing is pending and the minimum
    /// runtime has passed, then do one last pass and mark the importer inactive.
    ///
    /// After cancellation the minimum runtime no longer applies.
    pub async fn run(
        mut self,
        mut source: Box<dyn StagingSource>,
        progress: Arc<PipelineProgress>,
        cancel: CancellationToken,
        min_runtime: Duration,
    ) -> (Importer, Result<(), PipelineError>) {
        let started = Instant::now();
        log::info!("📥 Importer started ({} handoff)", source.backend_type());

        let result = loop {
            // Workers first: a worker stages before it deregisters
            let active = progress.active_workers();
            let pending = source.pending();
            let warming_up = !cancel.is_cancelled() && started.elapsed() < min_runtime;
            if active == 0 && pending == 0 && !warming_up {
                break Ok(());
            }

            match self.drain_once(source.as_mut(), &progress).await {
                Ok(_) => {}
                Err(e @ PipelineError::BatchLost { .. }) => {
                    log::error!("❌ Import stopped: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    log::warn!("⚠️  Import pass failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };

        // Final drain
        let result = match (result, self.drain_once(source.as_mut(), &progress).await) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(_)) => Ok(()),
        };

        self.report.batches_retained = source.retained() as u64;
        progress.set_importer_inactive();

        log::info!("📥 Importer stopped after {:.1}s", started.elapsed().as_secs_f64());
        log::info!("   ├─ Batches applied: {}", self.report.batches_applied);
        log::info!("   ├─ Rows applied: {} ({} new)", self.report.rows_applied, self.report.rows_inserted);
        log::info!("   ├─ Rows failed: {}", self.report.rows_failed);
        log::info!("   ├─ Batches retained: {}", self.report.batches_retained);
        log::info!("   └─ Batches lost: {}", self.report.batches_lost);

        (self, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::row_count;
    use crate::pipeline::staging::{ChannelStagingSource, FileStagingSink, FileStagingSource, StagingSink};
    use crate::pipeline::types::AnalyticRow;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn rows(entity: EntityId, timestamps: &[i64]) -> Vec<AnalyticRow> {
        timestamps
            .iter()
            .map(|&timestamp| AnalyticRow {
                entity_id: entity,
                timestamp,
                buy_price: 100,
                gap_sell_buy: 0.25,
                ..Default::default()
            })
            .collect()
    }

    fn dump(path: &std::path::Path, entity: EntityId) -> Vec<(i64, i64, f64)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT timestamp, buy_price, gap_sell_buy FROM \"{}\" ORDER BY timestamp",
                entity_table(entity)
            ))
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_import_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let mut importer = Importer::new(SchemaManager::open(&path).unwrap());
        let batch = StagedBatch::from_rows(2, &rows(2, &[300, 600, 900]));

        let first = importer.apply_batch(&batch).unwrap();
        assert!(first.table_created);
        assert_eq!(first.applied, 3);
        assert_eq!(first.inserted, 3);
        let snapshot = dump(&path, 2);

        let second = importer.apply_batch(&batch).unwrap();
        assert_eq!(second.applied, 3);
        assert_eq!(second.inserted, 0);
        assert!(!second.table_created);
        assert_eq!(dump(&path, 2), snapshot);
        assert_eq!(snapshot[0], (300, 100, 0.25));
    }

    #[test]
    fn test_short_rows_are_padded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let mut importer = Importer::new(SchemaManager::open(&path).unwrap());

        let batch = StagedBatch {
            entity_id: 13190,
            rows: vec![vec![SqlValue::Integer(13190), SqlValue::Integer(600)]],
        };
        let outcome = importer.apply_batch(&batch).unwrap();

        assert_eq!(outcome.padded, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(dump(&path, 13190), vec![(600, 0, 0.0)]);
    }

    #[test]
    fn test_partial_failure_commits_the_rest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let mut importer = Importer::new(SchemaManager::open(&path).unwrap());

        let mut batch = StagedBatch::from_rows(2, &rows(2, &[300, 600]));
        batch.rows.push(vec![SqlValue::Integer(0); ANALYTIC_COLUMNS.len() + 2]);

        let outcome = importer.apply_batch(&batch).unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(row_count(&path, "entity_00002"), 2);
    }

    #[test]
    fn test_recreates_dropped_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let mut importer = Importer::new(SchemaManager::open(&path).unwrap());
        importer
            .apply_batch(&StagedBatch::from_rows(2, &rows(2, &[300])))
            .unwrap();

        importer
            .schema
            .connection()
            .execute("DROP TABLE entity_00002", [])
            .unwrap();

        let outcome = importer
            .apply_batch(&StagedBatch::from_rows(2, &rows(2, &[600])))
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(dump(&path, 2).len(), 1);
    }

    #[tokio::test]
    async fn test_run_keeps_failed_batches_on_disk() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");
        let path = dir.path().join("analytics.db");

        let mut sink = FileStagingSink::for_worker(&staging, 0).unwrap();
        sink.stage(StagedBatch::from_rows(2, &rows(2, &[300, 600]))).unwrap();
        let mut bad = StagedBatch::from_rows(314, &rows(314, &[300]));
        bad.rows.push(vec![SqlValue::Integer(0); ANALYTIC_COLUMNS.len() + 1]);
        sink.stage(bad).unwrap();

        let source = FileStagingSource::new(&staging, Duration::from_millis(10)).unwrap();
        let progress = Arc::new(PipelineProgress::new(0, 0));
        let importer = Importer::new(SchemaManager::open(&path).unwrap());

        let (importer, result) = importer
            .run(Box::new(source), progress.clone(), CancellationToken::new(), Duration::ZERO)
            .await;
        result.unwrap();

        let report = importer.report();
        assert_eq!(report.batches_applied, 1);
        assert_eq!(report.batches_retained, 1);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.rows_failed, 1);
        assert!(!progress.importer_active());

        assert!(!staging.join("w00_00002_000001.batch").exists());
        assert!(staging.join("w00_00314_000002.batch").exists());
        assert_eq!(row_count(&path, "entity_00314"), 1);
    }

    #[test]
    fn test_rows_before_cutoff_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let mut importer =
            Importer::new(SchemaManager::open(&path).unwrap()).with_retention_cutoff(600);

        let outcome = importer
            .apply_batch(&StagedBatch::from_rows(2, &rows(2, &[300, 600, 900])))
            .unwrap();

        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.failed, 0);
        let stored: Vec<i64> = dump(&path, 2).into_iter().map(|(ts, _, _)| ts).collect();
        assert_eq!(stored, vec![600, 900]);
    }

    #[tokio::test]
    async fn test_unkeepable_batch_fails_run_but_later_batches_land() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");
        let path = dir.path().join("analytics.db");

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let source = ChannelStagingSource::new(rx, &staging, Duration::from_millis(10)).unwrap();

        let mut bad = StagedBatch::from_rows(2, &rows(2, &[300]));
        bad.rows.push(vec![SqlValue::Integer(0); ANALYTIC_COLUMNS.len() + 1]);
        tx.send(bad).await.unwrap();
        tx.send(StagedBatch::from_rows(2, &rows(2, &[600, 900]))).await.unwrap();
        drop(tx);

        // Nowhere to spill the rejected batch
        std::fs::remove_dir_all(&staging).unwrap();

        let importer = Importer::new(SchemaManager::open(&path).unwrap());
        let (importer, result) = importer
            .run(
                Box::new(source),
                Arc::new(PipelineProgress::new(0, 0)),
                CancellationToken::new(),
                Duration::ZERO,
            )
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::BatchLost { entity_id: 2, rows: 2, .. })
        ));
        let stored: Vec<i64> = dump(&path, 2).into_iter().map(|(ts, _, _)| ts).collect();
        assert_eq!(stored, vec![300, 600, 900]);

        let report = importer.report();
        assert_eq!(report.batches_applied, 1);
        assert_eq!(report.batches_lost, 1);
        assert_eq!(report.batches_retained, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_min_runtime_absorbs_late_batches() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");
        let path = dir.path().join("analytics.db");

        let source = FileStagingSource::new(&staging, Duration::from_millis(10)).unwrap();
        let progress = Arc::new(PipelineProgress::new(0, 0));
        assert_eq!(progress.active_workers(), 0);

        let importer = Importer::new(SchemaManager::open(&path).unwrap());
        let handle = tokio::spawn(importer.run(
            Box::new(source),
            progress.clone(),
            CancellationToken::new(),
            Duration::from_millis(1_500),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(progress.importer_active());
        FileStagingSink::for_worker(&staging, 0)
            .unwrap()
            .stage(StagedBatch::from_rows(2, &rows(2, &[300])))
            .unwrap();

        let (importer, result) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(importer.report().batches_applied, 1);
        assert_eq!(row_count(&path, "entity_00002"), 1);
        assert!(!progress.importer_active());
    }

    #[tokio::test]
    async fn test_cancel_skips_min_runtime() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");
        let path = dir.path().join("analytics.db");

        let source = FileStagingSource::new(&staging, Duration::from_millis(10)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let importer = Importer::new(SchemaManager::open(&path).unwrap());
        let started = Instant::now();
        let (_, result) = tokio::time::timeout(
            Duration::from_secs(10),
            importer.run(
                Box::new(source),
                Arc::new(PipelineProgress::new(0, 0)),
                cancel,
                Duration::from_secs(60),
            ),
        )
        .await
        .unwrap();

        result.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
