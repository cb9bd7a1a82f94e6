//! Partition workers and the signalling around them

pub mod backoff;
pub mod control;
pub mod metrics;
pub mod worker;

pub use backoff::ExponentialBackoff;
pub use control::{ControlPlane, RunState, WorkerControl, WorkerPhase};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use worker::{PartitionWorker, Sinks, WorkerSettings};
