//! Durable holding area for events that arrived ahead of a sequence gap
//!
//! One `Stash` per partition worker, persisted in the `stash` table so gap state
//! survives a controlled restart. Bounded per key, per partition and by age.
//! Entries past a bound are reported, not dropped: the caller dead-letters them
//! and only then evicts them.

use crate::event::EventEnvelope;
use crate::store::{lock, SharedConnection, StoreError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

#[derive(Debug, Clone)]
pub struct StashLimits {
    pub max_per_key: usize,
    pub max_total: usize,
    pub max_age: Duration,
}

impl Default for StashLimits {
    fn default() -> Self {
        Self {
            max_per_key: 100,
            max_total: 10_000,
            max_age: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    pub entity_key: String,
    pub sequence: u64,
    /// Encoded envelope as stored
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

pub struct Stash {
    conn: SharedConnection,
    partition: u32,
    limits: StashLimits,
}

impl Stash {
    pub fn new(conn: SharedConnection, partition: u32, limits: StashLimits) -> Self {
        Self {
            conn,
            partition,
            limits,
        }
    }

    /// Hold `envelope` until its predecessor is applied.
    ///
    /// Re-stashing an already held `(key, sequence)` is a no-op. Returns the
    /// entries over the per-key or partition bound, per-key overflow first.
    /// They stay stashed until the caller has dead-lettered them and passed
    /// them to [`Stash::evict`], so a retried `put` reports them again.
    pub fn put(
        &self,
        envelope: &EventEnvelope,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<StashEntry>, StoreError> {
        let payload = envelope.encode().map_err(|e| StoreError::Corrupt {
            key: envelope.entity_key.clone(),
            detail: e.to_string(),
        })?;

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO stash (partition_id, entity_key, sequence, envelope, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.partition,
                envelope.entity_key,
                envelope.sequence as i64,
                payload,
                received_at.timestamp_millis(),
            ],
        )?;

        let key_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM stash WHERE partition_id = ?1 AND entity_key = ?2",
            params![self.partition, envelope.entity_key],
            |row| row.get(0),
        )?;
        let over_key = (key_count as usize).saturating_sub(self.limits.max_per_key);
        let mut overflow = self.oldest(&tx, Some(&envelope.entity_key), over_key)?;

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM stash WHERE partition_id = ?1",
            params![self.partition],
            |row| row.get(0),
        )?;
        let remaining = (total as usize).saturating_sub(overflow.len());
        let over_total = remaining.saturating_sub(self.limits.max_total);
        if over_total > 0 {
            let candidates = self.oldest(&tx, None, over_total + overflow.len())?;
            let extra: Vec<StashEntry> = candidates
                .into_iter()
                .filter(|c| !overflow.contains(c))
                .take(over_total)
                .collect();
            overflow.extend(extra);
        }

        tx.commit()?;

        if !overflow.is_empty() {
            log::warn!(
                "Stash overflow on partition {}: {} entries over bound",
                self.partition,
                overflow.len()
            );
        }
        Ok(overflow)
    }

    fn oldest(
        &self,
        tx: &Transaction<'_>,
        key: Option<&str>,
        count: usize,
    ) -> Result<Vec<StashEntry>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = tx.prepare(
            "SELECT entity_key, sequence, envelope, received_at FROM stash
             WHERE partition_id = ?1 AND (?2 IS NULL OR entity_key = ?2)
             ORDER BY received_at ASC, rowid ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![self.partition, key, count as i64], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Remove entries previously reported by `put` or `expired`
    pub fn evict(&self, entries: &[StashEntry]) -> Result<usize, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for entry in entries {
            delete_entry(&tx, self.partition, &entry.entity_key, entry.sequence)?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Start draining `key` at `expected_next`.
    ///
    /// The drain yields envelopes in ascending sequence order and stops at the
    /// first gap. An entry is removed once the drain moves past it, so an entry
    /// whose application fails stays stashed for the retry.
    pub fn drain<'a>(&'a self, key: &'a str, expected_next: u64) -> StashDrain<'a> {
        StashDrain {
            stash: self,
            key,
            expected: expected_next,
            start: expected_next,
            done: false,
        }
    }

    /// Entries received before `now - max_age`, oldest first.
    ///
    /// Nothing is removed; pass them to [`Stash::evict`] once dead-lettered.
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<StashEntry>, StoreError> {
        let cutoff = (now - self.limits.max_age).timestamp_millis();

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT entity_key, sequence, envelope, received_at FROM stash
             WHERE partition_id = ?1 AND received_at < ?2
             ORDER BY received_at ASC, rowid ASC",
        )?;
        let expired = stmt
            .query_map(params![self.partition, cutoff], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        if !expired.is_empty() {
            log::warn!(
                "⌛ {} stashed events on partition {} expired with unresolved gaps",
                expired.len(),
                self.partition
            );
        }
        Ok(expired)
    }

    /// Entries held for `key`
    pub fn pending_for(&self, key: &str) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stash WHERE partition_id = ?1 AND entity_key = ?2",
            params![self.partition, key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Entries held on this partition
    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stash WHERE partition_id = ?1",
            params![self.partition],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Empty the stash on every partition (rebuild only)
    pub fn truncate_all(conn: &SharedConnection) -> Result<usize, StoreError> {
        let conn = lock(conn)?;
        let removed = conn.execute("DELETE FROM stash", [])?;
        log::info!("🧹 Truncated stash ({} entries)", removed);
        Ok(removed)
    }

    /// Drop entries for `key` below `before` and fetch the one at `sequence`
    fn advance(
        &self,
        key: &str,
        before: u64,
        sequence: u64,
    ) -> Result<Option<EventEnvelope>, StoreError> {
        let conn = lock(&self.conn)?;

        conn.execute(
            "DELETE FROM stash WHERE partition_id = ?1 AND entity_key = ?2 AND sequence < ?3",
            params![self.partition, key, before as i64],
        )?;

        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT envelope FROM stash
                 WHERE partition_id = ?1 AND entity_key = ?2 AND sequence = ?3",
                params![self.partition, key, sequence as i64],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|bytes| {
                EventEnvelope::decode(&bytes).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    detail: format!("stashed sequence {}: {}", sequence, e),
                })
            })
            .transpose()
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StashEntry> {
    let received_at: i64 = row.get(3)?;
    Ok(StashEntry {
        entity_key: row.get(0)?,
        sequence: row.get::<_, i64>(1)? as u64,
        payload: row.get(2)?,
        received_at: Utc
            .timestamp_millis_opt(received_at)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn delete_entry(
    tx: &Transaction<'_>,
    partition: u32,
    key: &str,
    sequence: u64,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM stash WHERE partition_id = ?1 AND entity_key = ?2 AND sequence = ?3",
        params![partition, key, sequence as i64],
    )?;
    Ok(())
}

/// Lazy, finite drain over one key's stashed events
pub struct StashDrain<'a> {
    stash: &'a Stash,
    key: &'a str,
    expected: u64,
    start: u64,
    done: bool,
}

impl StashDrain<'_> {
    /// Continue at `next` when the row has already moved past the drain.
    /// Entries below `next` are removed as covered.
    pub fn skip_to(&mut self, next: u64) {
        self.expected = self.expected.max(next);
    }

    /// End the drain with `sequence` and everything above it left stashed
    pub fn hold_from(&mut self, sequence: u64) {
        self.expected = self.expected.min(sequence);
        self.done = true;
    }

    /// Remove whatever the drain has moved past. Returns how many sequences it covered.
    pub fn finish(self) -> Result<u64, StoreError> {
        let conn = lock(&self.stash.conn)?;
        conn.execute(
            "DELETE FROM stash WHERE partition_id = ?1 AND entity_key = ?2 AND sequence < ?3",
            params![self.stash.partition, self.key, self.expected as i64],
        )?;
        Ok(self.expected.saturating_sub(self.start))
    }
}

impl Iterator for StashDrain<'_> {
    type Item = Result<EventEnvelope, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.stash.advance(self.key, self.expected, self.expected) {
            Ok(Some(envelope)) => {
                self.expected += 1;
                Some(Ok(envelope))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, OrderPaid};
    use crate::store::open_database;
    use tempfile::NamedTempFile;

    fn create_test_stash(limits: StashLimits) -> (NamedTempFile, SharedConnection, Stash) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_database(temp.path().to_str().unwrap(), "sql").unwrap();
        let stash = Stash::new(conn.clone(), 0, limits);
        (temp, conn, stash)
    }

    fn envelope(key: &str, sequence: u64) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("{}-{}", key, sequence),
            entity_key: key.to_string(),
            sequence,
            occurred_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            kind: EventKind::OrderPaid(OrderPaid {
                amount_cents: sequence as i64,
            }),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_drain_yields_in_order_and_stops_at_gap() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        for seq in [5, 3, 4, 7] {
            stash.put(&envelope("o-1", seq), at(0)).unwrap();
        }

        let mut drain = stash.drain("o-1", 3);
        let sequences: Vec<u64> = drain
            .by_ref()
            .map(|r| r.unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(drain.finish().unwrap(), 3);

        // 7 waits behind the gap at 6
        assert_eq!(stash.pending_for("o-1").unwrap(), 1);
    }

    #[test]
    fn test_drain_keeps_last_yielded_until_moved_past() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        stash.put(&envelope("o-1", 2), at(0)).unwrap();
        stash.put(&envelope("o-1", 3), at(0)).unwrap();

        {
            let mut drain = stash.drain("o-1", 2);
            let first = drain.next().unwrap().unwrap();
            assert_eq!(first.sequence, 2);
            // Abandoned without finish, as when applying `first` fails
        }
        assert_eq!(stash.pending_for("o-1").unwrap(), 2);
    }

    #[test]
    fn test_drain_prunes_stale_entries() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        stash.put(&envelope("o-1", 2), at(0)).unwrap();
        stash.put(&envelope("o-1", 3), at(0)).unwrap();

        let mut drain = stash.drain("o-1", 4);
        assert!(drain.next().is_none());
        drain.finish().unwrap();
        assert_eq!(stash.pending_for("o-1").unwrap(), 0);
    }

    #[test]
    fn test_drain_skips_ahead_when_row_moved_on() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        for seq in [3, 4, 6, 8] {
            stash.put(&envelope("o-1", seq), at(0)).unwrap();
        }

        let mut drain = stash.drain("o-1", 3);
        assert_eq!(drain.next().unwrap().unwrap().sequence, 3);
        // Another writer already applied up to 5
        drain.skip_to(6);
        assert_eq!(drain.next().unwrap().unwrap().sequence, 6);
        assert!(drain.next().is_none());
        drain.finish().unwrap();

        assert_eq!(stash.pending_for("o-1").unwrap(), 1);
    }

    #[test]
    fn test_drain_hold_keeps_entry() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        stash.put(&envelope("o-1", 2), at(0)).unwrap();
        stash.put(&envelope("o-1", 3), at(0)).unwrap();

        let mut drain = stash.drain("o-1", 2);
        let first = drain.next().unwrap().unwrap();
        drain.hold_from(first.sequence);
        assert!(drain.next().is_none());
        assert_eq!(drain.finish().unwrap(), 0);

        assert_eq!(stash.pending_for("o-1").unwrap(), 2);
    }

    #[test]
    fn test_duplicate_put_is_noop() {
        let (_temp, _conn, stash) = create_test_stash(StashLimits::default());
        stash.put(&envelope("o-1", 4), at(0)).unwrap();
        let evicted = stash.put(&envelope("o-1", 4), at(1)).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(stash.len().unwrap(), 1);
    }

    #[test]
    fn test_per_key_overflow_evicts_oldest() {
        let limits = StashLimits {
            max_per_key: 2,
            ..StashLimits::default()
        };
        let (_temp, _conn, stash) = create_test_stash(limits);

        stash.put(&envelope("o-1", 10), at(0)).unwrap();
        stash.put(&envelope("o-1", 11), at(1)).unwrap();
        stash.put(&envelope("o-2", 5), at(2)).unwrap();
        let overflow = stash.put(&envelope("o-1", 12), at(3)).unwrap();

        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].entity_key, "o-1");
        assert_eq!(overflow[0].sequence, 10);
        // Held until evicted explicitly
        assert_eq!(stash.pending_for("o-1").unwrap(), 3);

        assert_eq!(stash.evict(&overflow).unwrap(), 1);
        assert_eq!(stash.pending_for("o-1").unwrap(), 2);
        assert_eq!(stash.pending_for("o-2").unwrap(), 1);
    }

    #[test]
    fn test_retried_put_reports_same_overflow() {
        let limits = StashLimits {
            max_per_key: 1,
            ..StashLimits::default()
        };
        let (_temp, _conn, stash) = create_test_stash(limits);

        stash.put(&envelope("o-1", 3), at(0)).unwrap();
        let first = stash.put(&envelope("o-1", 4), at(1)).unwrap();
        // Caller failed to dead-letter; the record is retried
        let second = stash.put(&envelope("o-1", 4), at(2)).unwrap();

        assert_eq!(first, second);
        assert_eq!(second[0].sequence, 3);
        stash.evict(&second).unwrap();

        let mut drain = stash.drain("o-1", 4);
        assert_eq!(drain.next().unwrap().unwrap().sequence, 4);
    }

    #[test]
    fn test_total_overflow_evicts_oldest_across_keys() {
        let limits = StashLimits {
            max_per_key: 10,
            max_total: 2,
            ..StashLimits::default()
        };
        let (_temp, _conn, stash) = create_test_stash(limits);

        stash.put(&envelope("o-1", 3), at(0)).unwrap();
        stash.put(&envelope("o-2", 3), at(1)).unwrap();
        let overflow = stash.put(&envelope("o-3", 3), at(2)).unwrap();

        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].entity_key, "o-1");
        stash.evict(&overflow).unwrap();
        assert_eq!(stash.len().unwrap(), 2);
        assert_eq!(stash.pending_for("o-1").unwrap(), 0);
    }

    #[test]
    fn test_expire_removes_old_entries() {
        let limits = StashLimits {
            max_age: Duration::seconds(60),
            ..StashLimits::default()
        };
        let (_temp, _conn, stash) = create_test_stash(limits);

        stash.put(&envelope("o-1", 3), at(0)).unwrap();
        stash.put(&envelope("o-2", 3), at(100)).unwrap();

        let expired = stash.expired(at(120)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].entity_key, "o-1");
        assert_eq!(
            EventEnvelope::decode(&expired[0].payload).unwrap(),
            envelope("o-1", 3)
        );
        assert_eq!(stash.len().unwrap(), 2);

        stash.evict(&expired).unwrap();
        assert_eq!(stash.len().unwrap(), 1);
        assert!(stash.expired(at(120)).unwrap().is_empty());
    }

    #[test]
    fn test_stash_is_partition_scoped_and_durable() {
        let (_temp, conn, stash) = create_test_stash(StashLimits::default());
        stash.put(&envelope("o-1", 3), at(0)).unwrap();

        let other = Stash::new(conn.clone(), 1, StashLimits::default());
        assert!(other.is_empty().unwrap());

        // A fresh handle on the same partition sees the entry (restart)
        let reopened = Stash::new(conn.clone(), 0, StashLimits::default());
        assert_eq!(reopened.pending_for("o-1").unwrap(), 1);

        assert_eq!(Stash::truncate_all(&conn).unwrap(), 1);
        assert!(reopened.is_empty().unwrap());
    }
}
