//! File-backed log: one `partition-<n>.jsonl` per partition, one event per line
//!
//! Files are append-only. Only newline-terminated lines count as records, so a
//! line still being written is picked up on a later fetch. Blank lines are
//! skipped and do not take a position.

use super::{EventLog, StreamError, StreamRecord};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct PartitionIndex {
    /// Byte offset of every record, by position
    line_starts: Vec<u64>,
    /// Bytes already indexed
    scanned_to: u64,
}

pub struct JsonlEventLog {
    dir: PathBuf,
    indexes: Vec<Mutex<PartitionIndex>>,
}

impl JsonlEventLog {
    pub fn new(dir: impl Into<PathBuf>, partitions: u32) -> Self {
        let dir = dir.into();
        log::info!(
            "📂 JSONL event log: {} ({} partitions)",
            dir.display(),
            partitions
        );
        Self {
            dir,
            indexes: (0..partitions.max(1))
                .map(|_| Mutex::new(PartitionIndex::default()))
                .collect(),
        }
    }

    pub fn partition_path(&self, partition: u32) -> PathBuf {
        partition_path(&self.dir, partition)
    }

    fn index(&self, partition: u32) -> Result<&Mutex<PartitionIndex>, StreamError> {
        self.indexes
            .get(partition as usize)
            .ok_or(StreamError::UnknownPartition(partition))
    }

    /// Index any complete lines appended since the last scan
    async fn refresh(&self, partition: u32, index: &mut PartitionIndex) -> Result<(), StreamError> {
        let path = self.partition_path(partition);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < index.scanned_to {
            return Err(StreamError::Truncated { partition });
        }
        if len == index.scanned_to {
            return Ok(());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(index.scanned_to)).await?;

        let mut offset = index.scanned_to;
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 || line.last() != Some(&b'\n') {
                break;
            }
            if !is_blank(&line) {
                index.line_starts.push(offset);
            }
            offset += n as u64;
        }

        index.scanned_to = offset;
        Ok(())
    }
}

pub fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{}.jsonl", partition))
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn trim_line_end(mut line: Vec<u8>) -> Vec<u8> {
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }
    line
}

#[async_trait]
impl EventLog for JsonlEventLog {
    fn partitions(&self) -> u32 {
        self.indexes.len() as u32
    }

    async fn fetch(
        &self,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError> {
        let mut index = self.index(partition)?.lock().await;
        self.refresh(partition, &mut index).await?;

        let available = index.line_starts.len() as u64;
        if from >= available || max == 0 {
            return Ok(Vec::new());
        }

        let file = File::open(self.partition_path(partition)).await?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(index.line_starts[from as usize]))
            .await?;

        let wanted = (available - from).min(max as u64);
        let mut records = Vec::with_capacity(wanted as usize);
        let mut position = from;

        while (records.len() as u64) < wanted {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if is_blank(&line) {
                continue;
            }
            records.push(StreamRecord {
                position,
                payload: trim_line_end(line),
            });
            position += 1;
        }

        Ok(records)
    }

    async fn end_position(&self, partition: u32) -> Result<u64, StreamError> {
        let mut index = self.index(partition)?.lock().await;
        self.refresh(partition, &mut index).await?;
        Ok(index.line_starts.len() as u64)
    }
}
