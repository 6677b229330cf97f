//! Analytics store schema, retention and compaction
//!
//! One table per tracked entity, created lazily from [`ANALYTIC_COLUMNS`].
//! Eviction and compaction are only run by the coordinator while no import
//! is in flight.

use super::error::{is_disk_full, is_missing_table, PipelineError};
use super::types::{entity_table, is_real_column, EntityId, ANALYTIC_COLUMNS};
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params, Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};

/// `CREATE TABLE IF NOT EXISTS` statement for one entity
pub fn create_table_sql(entity: EntityId) -> String {
    let columns = ANALYTIC_COLUMNS
        .iter()
        .map(|name| {
            if is_real_column(name) {
                format!("{} REAL NOT NULL DEFAULT 0.0", name)
            } else {
                format!("{} INTEGER NOT NULL DEFAULT 0", name)
            }
        })
        .collect::<Vec<_>>()
        .join(",\n    ");

    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {},\n    PRIMARY KEY (timestamp)\n)",
        entity_table(entity),
        columns
    )
}

/// Min/max timestamp of an entity table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageMark {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

/// Result of a compaction attempt. The original file is untouched unless
/// the outcome is `Compacted`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Compacted { bytes_before: u64, bytes_after: u64 },
    /// Row counts of the copy disagreed with the original for these tables
    Discarded { mismatched: Vec<String> },
    DiskFull,
}

pub struct SchemaManager {
    conn: Connection,
    path: PathBuf,
}

impl SchemaManager {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        apply_optimized_pragmas(&conn)?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn table_exists(&self, entity: EntityId) -> Result<bool, PipelineError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![entity_table(entity)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Create the entity table if absent. Returns true when it was created.
    pub fn ensure_table(&self, entity: EntityId) -> Result<bool, PipelineError> {
        if self.table_exists(entity)? {
            return Ok(false);
        }
        self.conn.execute(&create_table_sql(entity), [])?;
        log::debug!("🆕 Created table {}", entity_table(entity));
        Ok(true)
    }

    /// Number of columns of an existing entity table
    pub fn column_count(&self, entity: EntityId) -> Result<usize, PipelineError> {
        let sql = format!("SELECT COUNT(*) FROM pragma_table_info('{}')", entity_table(entity));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// `Ok(None)` when the table is missing, `Some(None)` when it is empty
    pub fn coverage(&self, entity: EntityId) -> Result<Option<Option<CoverageMark>>, PipelineError> {
        let sql = format!(
            "SELECT MIN(timestamp), MAX(timestamp) FROM \"{}\"",
            entity_table(entity)
        );
        let result = self.conn.query_row(&sql, [], |row| {
            Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
        });

        match result {
            Ok((min, max)) => Ok(Some(min.zip(max).map(|(min_timestamp, max_timestamp)| {
                CoverageMark { min_timestamp, max_timestamp }
            }))),
            Err(e) if is_missing_table(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rows of an entity older than `before`
    pub fn expired_count(&self, entity: EntityId, before: i64) -> Result<u64, PipelineError> {
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE timestamp < ?1",
            entity_table(entity)
        );
        match self.conn.query_row(&sql, params![before], |row| row.get::<_, i64>(0)) {
            Ok(count) => Ok(count as u64),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every row older than `before`, returning how many went
    pub fn evict(&self, entity: EntityId, before: i64) -> Result<u64, PipelineError> {
        let sql = format!("DELETE FROM \"{}\" WHERE timestamp < ?1", entity_table(entity));
        match self.conn.execute(&sql, params![before]) {
            Ok(deleted) => Ok(deleted as u64),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn row_count(&self, entity: EntityId) -> Result<u64, PipelineError> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", entity_table(entity));
        match self.conn.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
            Ok(count) => Ok(count as u64),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the store into a fresh file and swap it in once every table's
    /// row count matches. Consumes the manager so no other handle is writing.
    pub fn compact(self, temp_path: Option<&Path>) -> Result<CompactionOutcome, PipelineError> {
        self.compact_verified(temp_path, verify_row_counts)
    }

    fn compact_verified<F>(
        self,
        temp_path: Option<&Path>,
        verify: F,
    ) -> Result<CompactionOutcome, PipelineError>
    where
        F: FnOnce(&Connection, &Path) -> Result<Vec<String>, PipelineError>,
    {
        let temp = match temp_path {
            Some(p) => p.to_path_buf(),
            None => sibling_path(&self.path, "compact"),
        };
        if temp.exists() {
            fs::remove_file(&temp)?;
        }

        let bytes_before = fs::metadata(&self.path)?.len();
        log::info!("🗜️  Compacting {} via {}", self.path.display(), temp.display());

        let escaped = temp.to_string_lossy().replace('\'', "''");
        if let Err(e) = self.conn.execute_batch(&format!("VACUUM main INTO '{}'", escaped)) {
            discard(&temp);
            if is_disk_full(&e) {
                log::error!("❌ Compaction aborted: disk full");
                return Ok(CompactionOutcome::DiskFull);
            }
            return Err(e.into());
        }

        let mismatched = match verify(&self.conn, &temp) {
            Ok(mismatched) => mismatched,
            Err(e) => {
                discard(&temp);
                return Err(e);
            }
        };
        if !mismatched.is_empty() {
            log::warn!(
                "⚠️  Compacted copy disagrees on {} table(s), keeping original",
                mismatched.len()
            );
            discard(&temp);
            return Ok(CompactionOutcome::Discarded { mismatched });
        }

        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        let path = self.path;
        drop(self.conn);

        if fs::rename(&temp, &path).is_err() {
            // Different filesystem: copy over, then drop the temp file
            if let Err(e) = fs::copy(&temp, &path) {
                discard(&temp);
                return Err(e.into());
            }
            discard(&temp);
        }
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", path.display(), suffix));
            if side.exists() {
                fs::remove_file(side)?;
            }
        }

        let bytes_after = fs::metadata(&path)?.len();
        log::info!("✅ Compaction done: {} → {} bytes", bytes_before, bytes_after);

        Ok(CompactionOutcome::Compacted { bytes_before, bytes_after })
    }
}

/// Compare per-table row counts of `conn` against the database at `copy`.
/// Returns the names of tables that differ or are missing from the copy.
pub fn verify_row_counts(conn: &Connection, copy: &Path) -> Result<Vec<String>, PipelineError> {
    let other = Connection::open_with_flags(copy, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut mismatched = Vec::new();
    for table in tables {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
        let expected: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        let actual = match other.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
            Ok(count) => Some(count),
            Err(e) if is_missing_table(&e) => None,
            Err(e) => return Err(e.into()),
        };
        if actual != Some(expected) {
            mismatched.push(table);
        }
    }

    Ok(mismatched)
}

fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", tag));
    path.with_file_name(name)
}

fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("⚠️  Could not remove {}: {}", temp.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn insert_rows(schema: &SchemaManager, entity: EntityId, timestamps: &[i64]) {
        schema.ensure_table(entity).unwrap();
        for ts in timestamps {
            schema
                .connection()
                .execute(
                    &format!(
                        "INSERT INTO \"{}\" (entity_id, timestamp) VALUES (?1, ?2)",
                        entity_table(entity)
                    ),
                    params![entity, ts],
                )
                .unwrap();
        }
    }

    #[test]
    fn test_ensure_table_creates_typed_columns() {
        let dir = tempdir().unwrap();
        let schema = SchemaManager::open(dir.path().join("analytics.db")).unwrap();

        assert!(schema.ensure_table(13190).unwrap());
        assert!(!schema.ensure_table(13190).unwrap());
        assert_eq!(schema.column_count(13190).unwrap(), ANALYTIC_COLUMNS.len());

        let mut stmt = schema
            .connection()
            .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info('entity_13190')")
            .unwrap();
        let columns: Vec<(String, String, i64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        for (name, ty, not_null, pk) in &columns {
            assert_eq!(*not_null, 1, "{} must be NOT NULL", name);
            let expected = if is_real_column(name) { "REAL" } else { "INTEGER" };
            assert_eq!(ty, expected, "column {}", name);
            assert_eq!(*pk == 1, name == "timestamp");
        }
    }

    #[test]
    fn test_coverage_states() {
        let dir = tempdir().unwrap();
        let schema = SchemaManager::open(dir.path().join("analytics.db")).unwrap();

        assert_eq!(schema.coverage(2).unwrap(), None);

        schema.ensure_table(2).unwrap();
        assert_eq!(schema.coverage(2).unwrap(), Some(None));

        insert_rows(&schema, 2, &[900, 300, 600]);
        assert_eq!(
            schema.coverage(2).unwrap(),
            Some(Some(CoverageMark { min_timestamp: 300, max_timestamp: 900 }))
        );
    }

    #[test]
    fn test_evict_is_monotone() {
        let dir = tempdir().unwrap();
        let schema = SchemaManager::open(dir.path().join("analytics.db")).unwrap();
        insert_rows(&schema, 2, &[300, 600, 900, 1_200, 1_500]);

        assert_eq!(schema.expired_count(2, 1_000).unwrap(), 3);
        assert_eq!(schema.evict(2, 1_000).unwrap(), 3);
        assert_eq!(schema.evict(2, 1_000).unwrap(), 0);

        let mark = schema.coverage(2).unwrap().unwrap().unwrap();
        assert!(mark.min_timestamp >= 1_000);
        assert_eq!(schema.row_count(2).unwrap(), 2);

        assert_eq!(schema.evict(4151, 1_000).unwrap(), 0);
    }

    #[test]
    fn test_compaction_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let schema = SchemaManager::open(&path).unwrap();
        insert_rows(&schema, 2, &(1..=200).map(|i| i * 300).collect::<Vec<_>>());
        insert_rows(&schema, 314, &[300, 600]);
        schema.evict(2, 30_000).unwrap();

        let outcome = schema.compact(None).unwrap();
        assert!(matches!(outcome, CompactionOutcome::Compacted { .. }));
        assert!(!dir.path().join("analytics.db.compact.tmp").exists());

        let schema = SchemaManager::open(&path).unwrap();
        assert_eq!(schema.row_count(2).unwrap(), 101);
        assert_eq!(schema.row_count(314).unwrap(), 2);
    }

    #[test]
    fn test_verify_row_counts_flags_differences() {
        let dir = tempdir().unwrap();
        let original = SchemaManager::open(dir.path().join("a.db")).unwrap();
        insert_rows(&original, 2, &[300, 600]);
        insert_rows(&original, 314, &[300]);

        let copy = SchemaManager::open(dir.path().join("b.db")).unwrap();
        insert_rows(&copy, 2, &[300]);

        let mismatched = verify_row_counts(original.connection(), copy.path()).unwrap();
        assert_eq!(mismatched, vec!["entity_00002".to_string(), "entity_00314".to_string()]);
    }

    fn file_bytes(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    #[test]
    fn test_discarded_compaction_keeps_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let schema = SchemaManager::open(&path).unwrap();
        insert_rows(&schema, 2, &[300, 600, 900]);
        insert_rows(&schema, 314, &[300]);
        schema
            .connection()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .unwrap();
        let before = file_bytes(&path);

        // The copy loses a row before it is checked
        let outcome = schema
            .compact_verified(None, |conn, copy| {
                Connection::open(copy)
                    .unwrap()
                    .execute("DELETE FROM entity_00002 WHERE timestamp = 600", [])
                    .unwrap();
                verify_row_counts(conn, copy)
            })
            .unwrap();

        assert_eq!(
            outcome,
            CompactionOutcome::Discarded { mismatched: vec!["entity_00002".to_string()] }
        );
        assert!(!dir.path().join("analytics.db.compact.tmp").exists());
        assert_eq!(file_bytes(&path), before);

        let schema = SchemaManager::open(&path).unwrap();
        assert_eq!(schema.row_count(2).unwrap(), 3);
        assert_eq!(schema.row_count(314).unwrap(), 1);
    }

    #[test]
    fn test_failed_compaction_leaves_store_usable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let schema = SchemaManager::open(&path).unwrap();
        insert_rows(&schema, 2, &[300, 600]);

        let unwritable = dir.path().join("missing").join("copy.db");
        assert!(schema.compact(Some(&unwritable)).is_err());
        assert!(!unwritable.exists());

        let schema = SchemaManager::open(&path).unwrap();
        assert_eq!(schema.row_count(2).unwrap(), 2);
    }
}
