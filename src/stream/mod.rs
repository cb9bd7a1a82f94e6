//! Partitioned, per-key-ordered event log the projector consumes
//!
//! Positions are 0-based record indexes within one partition. Consumers track
//! their own progress (see `store::CheckpointStore`); the log never learns what
//! has been acknowledged.

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;

pub use jsonl::JsonlEventLog;
pub use memory::MemoryEventLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub position: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown partition {0}")]
    UnknownPartition(u32),

    #[error("partition {partition} shrank below already indexed data")]
    Truncated { partition: u32 },

    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    fn partitions(&self) -> u32;

    /// Up to `max` records of `partition` starting at position `from`
    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError>;

    /// Position the next appended record will get
    async fn end_position(&self, partition: u32) -> Result<u64, StreamError>;
}

/// Stable partition for an entity key (FNV-1a, 64-bit)
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    });
    (hash % partitions.max(1) as u64) as u32
}
