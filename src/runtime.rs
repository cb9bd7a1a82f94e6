//! Wires one worker per partition, and exposes lag, metrics, rebuild and shutdown

use crate::config::ProjectorConfig;
use crate::ingest::{ControlPlane, IngestMetrics, MetricsSnapshot, PartitionWorker, Sinks};
use crate::rebuild::RebuildController;
use crate::stash::Stash;
use crate::store::{SharedConnection, StoreError};
use crate::stream::{EventLog, StreamError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLag {
    /// Position the next appended record will get
    pub latest: u64,
    /// Next position the worker will read (everything below is acknowledged)
    pub acknowledged: u64,
}

impl PartitionLag {
    pub fn behind(&self) -> u64 {
        self.latest.saturating_sub(self.acknowledged)
    }
}

pub struct ProjectionRuntime {
    log: Arc<dyn EventLog>,
    sinks: Sinks,
    metrics: Arc<IngestMetrics>,
    control: Arc<ControlPlane>,
    rebuild: Arc<RebuildController>,
    handles: Vec<JoinHandle<()>>,
}

impl ProjectionRuntime {
    /// Start with SQLite-backed sinks on `conn`. Must be called within a tokio runtime.
    pub fn start(log: Arc<dyn EventLog>, conn: SharedConnection, config: &ProjectorConfig) -> Self {
        let sinks = Sinks::sqlite(conn.clone());
        Self::start_with_sinks(log, conn, sinks, config)
    }

    /// Start with caller-supplied sinks. `conn` still backs the stash.
    pub fn start_with_sinks(
        log: Arc<dyn EventLog>,
        conn: SharedConnection,
        sinks: Sinks,
        config: &ProjectorConfig,
    ) -> Self {
        let metrics = Arc::new(IngestMetrics::new());
        let mut control = ControlPlane::new();
        let settings = config.worker_settings();

        let workers: Vec<PartitionWorker> = (0..log.partitions())
            .map(|partition| {
                PartitionWorker::new(
                    log.clone(),
                    sinks.clone(),
                    Stash::new(conn.clone(), partition, config.stash_limits()),
                    metrics.clone(),
                    control.register(partition),
                    settings.clone(),
                )
            })
            .collect();

        let control = Arc::new(control);
        let rebuild = Arc::new(RebuildController::new(
            control.clone(),
            sinks.views.clone(),
            sinks.checkpoints.clone(),
            conn,
            config.rebuild_gate(),
        ));

        let handles = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect::<Vec<_>>();

        log::info!("✅ Projection runtime started ({} partitions)", handles.len());

        Self {
            log,
            sinks,
            metrics,
            control,
            rebuild,
            handles,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn rebuild_controller(&self) -> Arc<RebuildController> {
        self.rebuild.clone()
    }

    /// Latest available and last acknowledged position for every partition
    pub async fn per_partition_lag(&self) -> Result<BTreeMap<u32, PartitionLag>, RuntimeError> {
        let mut lag = BTreeMap::new();
        for partition in self.control.partitions() {
            let latest = self.log.end_position(partition).await?;
            let acknowledged = self.sinks.checkpoints.load(partition).await?;
            lag.insert(
                partition,
                PartitionLag {
                    latest,
                    acknowledged,
                },
            );
        }
        Ok(lag)
    }

    /// Poll lag until every partition has acknowledged everything, or `timeout` passes
    pub async fn wait_caught_up(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(lag) = self.per_partition_lag().await {
                if lag.values().all(|l| l.behind() == 0) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop every worker after its in-flight event and wait for them to exit
    pub async fn shutdown(self) {
        log::info!("🛑 Shutting down projection runtime...");
        self.control.shutdown();

        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("❌ Partition worker panicked: {}", e);
            }
        }
        log::info!("✅ Projection runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use crate::stream::MemoryEventLog;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_lag_reaches_zero_on_garbage_input() {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_database(temp.path().to_str().unwrap(), "sql").unwrap();
        let log = Arc::new(MemoryEventLog::new(2));
        log.append_to(0, b"garbage".to_vec()).unwrap();
        log.append_to(1, b"{}".to_vec()).unwrap();

        let config = ProjectorConfig {
            poll_interval_ms: 10,
            ..ProjectorConfig::default()
        };
        let runtime = ProjectionRuntime::start(log, conn, &config);

        assert!(runtime.wait_caught_up(Duration::from_secs(5)).await);
        let lag = runtime.per_partition_lag().await.unwrap();
        assert_eq!(lag.len(), 2);
        assert_eq!(
            lag[&0],
            PartitionLag {
                latest: 1,
                acknowledged: 1
            }
        );
        assert_eq!(runtime.metrics().dead_lettered, 2);

        runtime.shutdown().await;
    }

    #[test]
    fn test_behind_saturates() {
        let lag = PartitionLag {
            latest: 3,
            acknowledged: 5,
        };
        assert_eq!(lag.behind(), 0);
    }
}
