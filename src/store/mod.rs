//! View store, checkpoint store and the shared SQLite plumbing under them
//!
//! All tables live in one SQLite database (schema in `sql/`). Components share a
//! single connection behind `Arc<Mutex<_>>`; every write goes through a scoped
//! `Transaction` that is committed explicitly and rolled back when dropped.

pub mod checkpoint;
pub mod sqlite_view;

use crate::projection::OrderView;
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use checkpoint::{CheckpointStore, SqliteCheckpointStore};
pub use sqlite_view::{SortOrder, SqliteViewStore, ViewPage, ViewQuery};

pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt stored data for {key}: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("schema migration failed: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result of a conditional view write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Row and sequence written in one transaction
    Applied,
    /// Stored sequence moved since it was read; nothing written
    Conflict { current: Option<u64> },
    /// Event id already recorded for this key; nothing written
    DuplicateEvent,
}

/// Transactional row storage for the materialized view
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Current row for `key`, `None` if the key was never applied
    async fn load(&self, key: &str) -> Result<Option<OrderView>, StoreError>;

    /// Write `new_row` only if the stored `last_applied_sequence` still equals
    /// `expected_last` (`None` meaning no row exists yet).
    ///
    /// The new row's event id is recorded under a uniqueness constraint in the
    /// same transaction; a violation yields `DuplicateEvent`.
    async fn apply_if_sequence_matches(
        &self,
        key: &str,
        expected_last: Option<u64>,
        new_row: &OrderView,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Whether `event_id` has already been applied to `key`
    async fn was_applied(&self, key: &str, event_id: &str) -> Result<bool, StoreError>;

    /// Remove every row and event identity (rebuild only)
    async fn truncate(&self) -> Result<(), StoreError>;
}

/// Lock the shared connection, treating a poisoned lock as an outage
pub fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
}

/// Open (or create) the projector database, tune it, and run migrations.
pub fn open_database(db_path: &str, schema_dir: &str) -> Result<SharedConnection, StoreError> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let mut conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn)?;
    run_schema_migrations(&mut conn, schema_dir)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Run schema migrations from SQL files
///
/// Executes every `.sql` file in `schema_dir` in file-name order (`01_`, `02_`, ...).
/// Files must use `IF NOT EXISTS` so re-running on an existing database is a no-op.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Migration(format!(
            "schema directory not found: {}",
            schema_dir
        )));
    }

    let read_dir = fs::read_dir(schema_path)
        .map_err(|e| StoreError::Migration(format!("{}: {}", schema_dir, e)))?;

    let mut sql_files: Vec<_> = read_dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        let sql_content = fs::read_to_string(&path)
            .map_err(|e| StoreError::Migration(format!("{}: {}", filename, e)))?;

        conn.execute_batch(&sql_content)
            .map_err(|e| StoreError::Migration(format!("{}: {}", filename, e)))?;

        log::debug!("   ├─ applied {}", filename);
    }

    log::info!("✅ Schema migrations complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_migrations_are_idempotent() {
        let temp = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp.path()).unwrap();

        run_schema_migrations(&mut conn, "sql").unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('order_views', 'applied_events', 'stash', 'dead_letters', 'partition_offsets')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_missing_schema_dir_fails() {
        let temp = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp.path()).unwrap();

        let result = run_schema_migrations(&mut conn, "does/not/exist");
        assert!(matches!(result, Err(StoreError::Migration(_))));
    }
}
