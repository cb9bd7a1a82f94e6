//! Per-partition offset checkpoints
//!
//! The stored value is the next stream position to read: every record below it
//! has been durably applied, deduped, skipped, stashed or dead-lettered.

use super::{lock, SharedConnection, StoreError};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Next position to read for `partition` (0 if never committed)
    async fn load(&self, partition: u32) -> Result<u64, StoreError>;

    /// Advance the checkpoint. Values at or below the stored one are ignored.
    async fn commit(&self, partition: u32, next_position: u64) -> Result<(), StoreError>;

    /// Rewind the given partitions to the start of the stream (rebuild only)
    async fn reset(&self, partitions: &[u32]) -> Result<(), StoreError>;
}

pub struct SqliteCheckpointStore {
    conn: SharedConnection,
}

impl SqliteCheckpointStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, partition: u32) -> Result<u64, StoreError> {
        let conn = lock(&self.conn)?;
        let position: Option<i64> = conn
            .query_row(
                "SELECT next_position FROM partition_offsets WHERE partition_id = ?1",
                params![partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.unwrap_or(0) as u64)
    }

    async fn commit(&self, partition: u32, next_position: u64) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let now = chrono::Utc::now().timestamp_millis();

        let changed = conn.execute(
            "INSERT INTO partition_offsets (partition_id, next_position, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(partition_id) DO UPDATE SET
                 next_position = excluded.next_position,
                 updated_at = excluded.updated_at
             WHERE excluded.next_position > partition_offsets.next_position",
            params![partition, next_position as i64, now],
        )?;

        if changed == 0 {
            log::warn!(
                "Ignored non-monotonic checkpoint for partition {}: {}",
                partition,
                next_position
            );
        }
        Ok(())
    }

    async fn reset(&self, partitions: &[u32]) -> Result<(), StoreError> {
        let mut conn = lock(&self.conn)?;
        let now = chrono::Utc::now().timestamp_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for partition in partitions {
            tx.execute(
                "INSERT INTO partition_offsets (partition_id, next_position, updated_at)
                 VALUES (?1, 0, ?2)
                 ON CONFLICT(partition_id) DO UPDATE SET next_position = 0, updated_at = excluded.updated_at",
                params![partition, now],
            )?;
        }

        tx.commit()?;
        log::info!("⏮️  Reset checkpoints for partitions {:?}", partitions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (NamedTempFile, SqliteCheckpointStore) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_database(temp.path().to_str().unwrap(), "sql").unwrap();
        (temp, SqliteCheckpointStore::new(conn))
    }

    #[tokio::test]
    async fn test_unknown_partition_starts_at_zero() {
        let (_temp, store) = create_test_store();
        assert_eq!(store.load(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let (_temp, store) = create_test_store();

        store.commit(0, 5).await.unwrap();
        store.commit(0, 3).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), 5);

        store.commit(0, 9).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_reset_rewinds_only_listed_partitions() {
        let (_temp, store) = create_test_store();
        store.commit(0, 5).await.unwrap();
        store.commit(1, 7).await.unwrap();

        store.reset(&[0]).await.unwrap();

        assert_eq!(store.load(0).await.unwrap(), 0);
        assert_eq!(store.load(1).await.unwrap(), 7);

        // Commits advance again from zero
        store.commit(0, 1).await.unwrap();
        assert_eq!(store.load(0).await.unwrap(), 1);
    }
}
