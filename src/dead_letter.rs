//! Dead-letter sink for events the projector can never apply
//!
//! Write-only from the ingest loop's point of view: nothing in here is retried
//! by the main loop. `count` and `list_recent` exist for operators and tests.

use crate::store::{lock, SharedConnection, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Bytes were not a parseable envelope
    DecodeFailed,
    /// Envelope parsed but failed validation (unknown type, bad payload)
    ValidationFailed,
    /// Projection refused the event (arithmetic overflow, key mismatch)
    ProjectionRejected,
    /// Evicted from a full stash
    StashOverflow,
    /// Stashed longer than the allowed age without its gap closing
    GapUnresolved,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::DecodeFailed => "decode_failed",
            DeadLetterReason::ValidationFailed => "validation_failed",
            DeadLetterReason::ProjectionRejected => "projection_rejected",
            DeadLetterReason::StashOverflow => "stash_overflow",
            DeadLetterReason::GapUnresolved => "gap_unresolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decode_failed" => Some(DeadLetterReason::DecodeFailed),
            "validation_failed" => Some(DeadLetterReason::ValidationFailed),
            "projection_rejected" => Some(DeadLetterReason::ProjectionRejected),
            "stash_overflow" => Some(DeadLetterReason::StashOverflow),
            "gap_unresolved" => Some(DeadLetterReason::GapUnresolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub partition: Option<u32>,
    /// Stream position, when the event came straight off the stream
    pub position: Option<u64>,
    pub entity_key: Option<String>,
    pub reason: DeadLetterReason,
    pub detail: Option<String>,
    /// Original bytes, or the re-encoded envelope for stash evictions
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(reason: DeadLetterReason, payload: Vec<u8>) -> Self {
        Self {
            partition: None,
            position: None,
            entity_key: None,
            reason,
            detail: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn at(mut self, partition: u32, position: Option<u64>) -> Self {
        self.partition = Some(partition);
        self.position = position;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

pub struct SqliteDeadLetterSink {
    conn: SharedConnection,
}

impl SqliteDeadLetterSink {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Dead letters recorded under `reason`, or all of them
    pub fn count(&self, reason: Option<DeadLetterReason>) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = match reason {
            Some(reason) => conn.query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE reason = ?1",
                [reason.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    /// Most recent dead letters first
    pub fn list_recent(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT partition_id, position, entity_key, reason, detail, payload, created_at
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, Option<u32>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(partition_id, position, entity_key, reason, detail, payload, created_at)| {
                    let reason =
                        DeadLetterReason::parse(&reason).ok_or_else(|| StoreError::Corrupt {
                            key: entity_key.clone().unwrap_or_default(),
                            detail: format!("unknown dead-letter reason {:?}", reason),
                        })?;
                    let created_at = Utc
                        .timestamp_millis_opt(created_at)
                        .single()
                        .unwrap_or_else(Utc::now);
                    Ok(DeadLetter {
                        partition: partition_id,
                        position: position.map(|p| p as u64),
                        entity_key,
                        reason,
                        detail,
                        payload,
                        created_at,
                    })
                },
            )
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO dead_letters
                 (partition_id, position, entity_key, reason, detail, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                letter.partition,
                letter.position.map(|p| p as i64),
                letter.entity_key,
                letter.reason.as_str(),
                letter.detail,
                letter.payload,
                letter.created_at.timestamp_millis(),
            ],
        )?;

        log::warn!(
            "☠️  Dead-lettered event (partition: {:?}, position: {:?}, key: {:?}, reason: {})",
            letter.partition,
            letter.position,
            letter.entity_key,
            letter.reason.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use tempfile::NamedTempFile;

    fn create_test_sink() -> (NamedTempFile, SqliteDeadLetterSink) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_database(temp.path().to_str().unwrap(), "sql").unwrap();
        (temp, SqliteDeadLetterSink::new(conn))
    }

    #[tokio::test]
    async fn test_send_and_list() {
        let (_temp, sink) = create_test_sink();

        sink.send(
            DeadLetter::new(DeadLetterReason::DecodeFailed, b"{oops".to_vec())
                .at(2, Some(41))
                .with_detail("expected value"),
        )
        .await
        .unwrap();
        sink.send(
            DeadLetter::new(DeadLetterReason::StashOverflow, b"{}".to_vec())
                .at(2, None)
                .with_key("order-9"),
        )
        .await
        .unwrap();

        assert_eq!(sink.count(None).unwrap(), 2);
        assert_eq!(sink.count(Some(DeadLetterReason::DecodeFailed)).unwrap(), 1);
        assert_eq!(sink.count(Some(DeadLetterReason::GapUnresolved)).unwrap(), 0);

        let recent = sink.list_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reason, DeadLetterReason::StashOverflow);
        assert_eq!(recent[0].entity_key.as_deref(), Some("order-9"));
        assert_eq!(recent[1].payload, b"{oops".to_vec());
        assert_eq!(recent[1].position, Some(41));
        assert_eq!(recent[1].partition, Some(2));
    }

    #[test]
    fn test_reason_strings_parse_back() {
        for reason in [
            DeadLetterReason::DecodeFailed,
            DeadLetterReason::ValidationFailed,
            DeadLetterReason::ProjectionRejected,
            DeadLetterReason::StashOverflow,
            DeadLetterReason::GapUnresolved,
        ] {
            assert_eq!(DeadLetterReason::parse(reason.as_str()), Some(reason));
        }
    }
}
