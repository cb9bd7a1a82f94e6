//! In-process partitioned log for tests and demos

use super::{partition_for_key, EventLog, StreamError, StreamRecord};
use crate::event::EventEnvelope;
use async_trait::async_trait;
use std::sync::RwLock;

pub struct MemoryEventLog {
    partitions: Vec<RwLock<Vec<Vec<u8>>>>,
}

impl MemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    /// Append raw bytes to the partition `key` routes to. Returns `(partition, position)`.
    pub fn append(&self, key: &str, payload: Vec<u8>) -> Result<(u32, u64), StreamError> {
        let partition = partition_for_key(key, self.partitions.len() as u32);
        let position = self.append_to(partition, payload)?;
        Ok((partition, position))
    }

    /// Append raw bytes to an explicit partition (e.g. undecodable records)
    pub fn append_to(&self, partition: u32, payload: Vec<u8>) -> Result<u64, StreamError> {
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or(StreamError::UnknownPartition(partition))?;
        let mut records = slot
            .write()
            .map_err(|_| StreamError::Unavailable("partition lock poisoned".to_string()))?;
        records.push(payload);
        Ok(records.len() as u64 - 1)
    }

    pub fn append_envelope(&self, envelope: &EventEnvelope) -> Result<(u32, u64), StreamError> {
        let bytes = envelope
            .encode()
            .map_err(|e| StreamError::Unavailable(format!("encode failed: {}", e)))?;
        self.append(&envelope.entity_key, bytes)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError> {
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or(StreamError::UnknownPartition(partition))?;
        let records = slot
            .read()
            .map_err(|_| StreamError::Unavailable("partition lock poisoned".to_string()))?;

        Ok(records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(position, payload)| StreamRecord {
                position: position as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn end_position(&self, partition: u32) -> Result<u64, StreamError> {
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or(StreamError::UnknownPartition(partition))?;
        let records = slot
            .read()
            .map_err(|_| StreamError::Unavailable("partition lock poisoned".to_string()))?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition() {
        let log = MemoryEventLog::new(4);
        let (p1, pos1) = log.append("order-7", b"a".to_vec()).unwrap();
        let (p2, pos2) = log.append("order-7", b"b".to_vec()).unwrap();

        assert_eq!(p1, p2);
        assert_eq!((pos1, pos2), (0, 1));
        assert_eq!(log.end_position(p1).await.unwrap(), 2);

        let records = log.fetch(p1, 1, 10).await.unwrap();
        assert_eq!(
            records,
            vec![StreamRecord {
                position: 1,
                payload: b"b".to_vec()
            }]
        );
    }

    #[tokio::test]
    async fn test_fetch_respects_max_and_bounds() {
        let log = MemoryEventLog::new(1);
        for i in 0..5u8 {
            log.append_to(0, vec![i]).unwrap();
        }

        let batch = log.fetch(0, 2, 2).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.position).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.fetch(0, 9, 2).await.unwrap().is_empty());
        assert!(matches!(
            log.fetch(3, 0, 1).await,
            Err(StreamError::UnknownPartition(3))
        ));
    }
}
