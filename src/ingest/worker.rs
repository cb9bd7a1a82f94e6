//! One partition's ingest loop
//!
//! Per record: decode, load the key's row, decide, then apply / dedup / skip /
//! stash. Every decision is followed by draining the key's stash. The checkpoint
//! is committed only after every write the record caused has committed. Any
//! storage error abandons the record uncommitted and retries it after a backoff.
//! Stash entries leave the stash only after their dead letter is written.

use super::backoff::ExponentialBackoff;
use super::control::{WorkerControl, WorkerPhase};
use super::metrics::IngestMetrics;
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, SqliteDeadLetterSink};
use crate::event::EventEnvelope;
use crate::projection::{decide, project, OrderView, SequenceDecision};
use crate::stash::{Stash, StashEntry};
use crate::store::{
    ApplyOutcome, CheckpointStore, SharedConnection, SqliteCheckpointStore, SqliteViewStore,
    StoreError, ViewStore,
};
use crate::stream::{EventLog, StreamRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub fetch_batch_size: usize,
    pub poll_interval: Duration,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            fetch_batch_size: 256,
            poll_interval: Duration::from_millis(200),
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
        }
    }
}

/// Storage handles a worker writes through
#[derive(Clone)]
pub struct Sinks {
    pub views: Arc<dyn ViewStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl Sinks {
    /// All three backed by the shared SQLite connection
    pub fn sqlite(conn: SharedConnection) -> Self {
        Self {
            views: Arc::new(SqliteViewStore::new(conn.clone())),
            checkpoints: Arc::new(SqliteCheckpointStore::new(conn.clone())),
            dead_letters: Arc::new(SqliteDeadLetterSink::new(conn)),
        }
    }
}

/// Outcome of one conditional write attempt
enum Attempt {
    Applied,
    Conflict,
    /// Event id already applied; nothing written
    Settled,
    /// Projection refused the event and it was dead-lettered
    Rejected,
}

pub struct PartitionWorker {
    partition: u32,
    log: Arc<dyn EventLog>,
    sinks: Sinks,
    stash: Stash,
    metrics: Arc<IngestMetrics>,
    control: WorkerControl,
    settings: WorkerSettings,
}

impl PartitionWorker {
    pub fn new(
        log: Arc<dyn EventLog>,
        sinks: Sinks,
        stash: Stash,
        metrics: Arc<IngestMetrics>,
        control: WorkerControl,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            partition: control.partition(),
            log,
            sinks,
            stash,
            metrics,
            control,
            settings,
        }
    }

    pub async fn run(mut self) {
        log::info!("🚀 Partition {} worker started", self.partition);

        let mut backoff =
            ExponentialBackoff::new(self.settings.backoff_initial_ms, self.settings.backoff_max_ms);
        // Next position to read; `None` forces a reload from the checkpoint
        let mut position: Option<u64> = None;

        loop {
            if self.control.is_shutdown() {
                break;
            }
            if !self.control.should_run() {
                if !self.control.wait_until_running().await {
                    break;
                }
                position = None;
            }

            let from = match position {
                Some(from) => from,
                None => match self.sinks.checkpoints.load(self.partition).await {
                    Ok(from) => {
                        log::info!("📍 Partition {} resuming at position {}", self.partition, from);
                        position = Some(from);
                        from
                    }
                    Err(e) => {
                        self.retry_later(&mut backoff, &e.to_string()).await;
                        continue;
                    }
                },
            };

            let batch = match self
                .log
                .fetch(self.partition, from, self.settings.fetch_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("⚠️  Partition {} fetch failed: {}", self.partition, e);
                    let delay = backoff.next_delay();
                    self.control.sleep(delay).await;
                    continue;
                }
            };

            if batch.is_empty() {
                if let Err(e) = self.expire_stash().await {
                    self.retry_later(&mut backoff, &e.to_string()).await;
                    continue;
                }
                let idle = self.settings.poll_interval;
                self.control.sleep(idle).await;
                continue;
            }

            for record in &batch {
                if !self.control.should_run() {
                    break;
                }
                match self.process_record(record).await {
                    Ok(()) => {
                        position = Some(record.position + 1);
                        backoff.reset();
                    }
                    Err(e) => {
                        self.retry_later(&mut backoff, &e.to_string()).await;
                        break;
                    }
                }
            }
        }

        self.control.report(WorkerPhase::Stopped);
        log::info!("🛑 Partition {} worker stopped", self.partition);
    }

    async fn retry_later(&mut self, backoff: &mut ExponentialBackoff, error: &str) {
        self.metrics.record_storage_retry();
        let delay = backoff.next_delay();
        log::warn!(
            "⏳ Partition {} storage unavailable ({}), retry {} in {}ms",
            self.partition,
            error,
            backoff.attempts(),
            delay.as_millis()
        );
        self.control.sleep(delay).await;
    }

    /// Handle one stream record and acknowledge it
    pub async fn process_record(&self, record: &StreamRecord) -> Result<(), StoreError> {
        match EventEnvelope::decode(&record.payload) {
            Ok(envelope) => self.handle_envelope(&envelope).await?,
            Err(e) => {
                self.dead_letter(
                    DeadLetter::new(e.reason(), record.payload.clone())
                        .at(self.partition, Some(record.position))
                        .with_detail(e.to_string()),
                )
                .await?;
            }
        }

        self.sinks
            .checkpoints
            .commit(self.partition, record.position + 1)
            .await
    }

    async fn handle_envelope(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let key = envelope.entity_key.as_str();

        loop {
            let current = self.sinks.views.load(key).await?;
            let last = current.as_ref().and_then(OrderView::applied_sequence);

            let mut decision = decide(last, envelope.sequence);
            if decision == SequenceDecision::SkipStale
                && self.sinks.views.was_applied(key, &envelope.event_id).await?
            {
                // An older event we already applied is a replay
                decision = SequenceDecision::Dedup;
            }

            let next_expected = match decision {
                SequenceDecision::Apply => match self.try_apply(current, last, envelope).await? {
                    Attempt::Applied => envelope.sequence + 1,
                    Attempt::Conflict => continue,
                    Attempt::Settled | Attempt::Rejected => return Ok(()),
                },
                SequenceDecision::Dedup => {
                    self.metrics.record_duplicate();
                    log::debug!("Dedup {} seq {}", key, envelope.sequence);
                    last.unwrap_or(0) + 1
                }
                SequenceDecision::SkipStale => {
                    self.metrics.record_out_of_order();
                    log::warn!(
                        "Skipping stale event {} for {}: seq {} < last applied {:?}",
                        envelope.event_id,
                        key,
                        envelope.sequence,
                        last
                    );
                    last.unwrap_or(0) + 1
                }
                SequenceDecision::Stash => {
                    self.metrics.record_gap();
                    log::debug!(
                        "Gap for {}: stashing seq {} (last applied {:?})",
                        key,
                        envelope.sequence,
                        last
                    );
                    let overflow = self.stash.put(envelope, Utc::now())?;
                    self.evict_stashed(overflow, DeadLetterReason::StashOverflow)
                        .await?;
                    last.unwrap_or(0) + 1
                }
            };

            // Also covers a stash left undrained by a crash between apply and drain
            return self.drain_stash(key, next_expected).await;
        }
    }

    async fn try_apply(
        &self,
        current: Option<OrderView>,
        last: Option<u64>,
        envelope: &EventEnvelope,
    ) -> Result<Attempt, StoreError> {
        let key = envelope.entity_key.as_str();
        let base = current.unwrap_or_else(|| OrderView::empty(key));

        let new_row = match project(&base, envelope) {
            Ok(row) => row,
            Err(e) => {
                let (payload, detail) = match envelope.encode() {
                    Ok(bytes) => (bytes, e.to_string()),
                    Err(encode_err) => {
                        log::error!(
                            "❌ Could not re-encode rejected event {}: {}",
                            envelope.event_id,
                            encode_err
                        );
                        (
                            Vec::new(),
                            format!("{}; payload not re-encodable: {}", e, encode_err),
                        )
                    }
                };
                self.dead_letter(
                    DeadLetter::new(DeadLetterReason::ProjectionRejected, payload)
                        .at(self.partition, None)
                        .with_key(key)
                        .with_detail(detail),
                )
                .await?;
                return Ok(Attempt::Rejected);
            }
        };

        match self
            .sinks
            .views
            .apply_if_sequence_matches(key, last, &new_row)
            .await?
        {
            ApplyOutcome::Applied => {
                self.metrics.record_applied();
                log::debug!("Applied {} seq {}", key, envelope.sequence);
                Ok(Attempt::Applied)
            }
            ApplyOutcome::Conflict { current } => {
                self.metrics.record_conflict();
                log::debug!(
                    "Conflict on {}: expected {:?}, found {:?}",
                    key,
                    last,
                    current
                );
                Ok(Attempt::Conflict)
            }
            ApplyOutcome::DuplicateEvent => {
                self.metrics.record_duplicate();
                log::debug!("Duplicate event id {} for {}", envelope.event_id, key);
                Ok(Attempt::Settled)
            }
        }
    }

    /// Apply stashed events for `key` from `expected` on until the first gap
    async fn drain_stash(&self, key: &str, expected: u64) -> Result<(), StoreError> {
        let mut drain = self.stash.drain(key, expected);

        'entries: while let Some(next) = drain.next() {
            let envelope = next?;

            // Re-read and re-decide until this entry is settled
            loop {
                let current = self.sinks.views.load(key).await?;
                let last = current.as_ref().and_then(OrderView::applied_sequence);

                match decide(last, envelope.sequence) {
                    SequenceDecision::Apply => {
                        match self.try_apply(current, last, &envelope).await? {
                            Attempt::Applied => {
                                self.metrics.record_stash_drained();
                                break;
                            }
                            Attempt::Conflict => continue,
                            Attempt::Settled => break,
                            // Gap stays open behind a dead-lettered event
                            Attempt::Rejected => break 'entries,
                        }
                    }
                    SequenceDecision::Dedup | SequenceDecision::SkipStale => {
                        // Another writer got here first
                        drain.skip_to(last.unwrap_or(0) + 1);
                        break;
                    }
                    SequenceDecision::Stash => {
                        drain.hold_from(envelope.sequence);
                        break 'entries;
                    }
                }
            }
        }

        let drained = drain.finish()?;
        if drained > 0 {
            log::debug!("Drained {} stashed events for {}", drained, key);
        }
        Ok(())
    }

    async fn expire_stash(&self) -> Result<(), StoreError> {
        let expired = self.stash.expired(Utc::now())?;
        self.evict_stashed(expired, DeadLetterReason::GapUnresolved)
            .await
    }

    /// Dead-letter `entries`, then remove them from the stash
    async fn evict_stashed(
        &self,
        entries: Vec<StashEntry>,
        reason: DeadLetterReason,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            self.dead_letter(
                DeadLetter::new(reason, entry.payload.clone())
                    .at(self.partition, None)
                    .with_key(entry.entity_key.clone())
                    .with_detail(format!("stashed sequence {}", entry.sequence)),
            )
            .await?;
        }
        self.stash.evict(&entries)?;
        Ok(())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.sinks.dead_letters.send(letter).await?;
        self.metrics.record_dead_letter();
        Ok(())
    }
}
