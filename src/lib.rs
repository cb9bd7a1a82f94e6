//! Order view projector: folds a partitioned, per-key-ordered event stream into
//! a SQLite materialized view, applying every event exactly once in effect.

pub mod config;
pub mod dead_letter;
pub mod event;
pub mod ingest;
pub mod projection;
pub mod rebuild;
pub mod runtime;
pub mod sqlite_pragma;
pub mod stash;
pub mod store;
pub mod stream;

pub use config::{ConfigError, ProjectorConfig};
pub use runtime::{PartitionLag, ProjectionRuntime, RuntimeError};
