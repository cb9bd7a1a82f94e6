use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every partition worker of one runtime
#[derive(Debug, Default)]
pub struct IngestMetrics {
    applied: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    gaps: AtomicU64,
    conflicts: AtomicU64,
    dead_lettered: AtomicU64,
    stash_drained: AtomicU64,
    storage_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub gaps: u64,
    pub conflicts: u64,
    pub dead_lettered: u64,
    pub stash_drained: u64,
    pub storage_retries: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stash_drained(&self) {
        self.stash_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_retry(&self) {
        self.storage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            stash_drained: self.stash_drained.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = IngestMetrics::new();
        metrics.record_applied();
        metrics.record_applied();
        metrics.record_duplicate();
        metrics.record_gap();
        metrics.record_storage_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.gaps, 1);
        assert_eq!(snapshot.storage_retries, 1);
        assert_eq!(snapshot.out_of_order, 0);
    }
}
