//! Projector configuration from environment variables

use crate::ingest::WorkerSettings;
use crate::rebuild::RebuildGate;
use crate::stash::StashLimits;
use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("BACKOFF_MAX_MS ({max}) is below BACKOFF_INITIAL_MS ({initial})")]
    BackoffRange { initial: u64, max: u64 },
}

/// Configuration for the projector runtime
///
/// Loaded from environment variables with defaults; unparseable values fall
/// back to the default.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory of ordered `.sql` schema files
    pub schema_dir: String,

    /// Directory holding `partition-<n>.jsonl` stream files
    pub stream_dir: String,

    pub partitions: u32,

    /// Records fetched per poll
    pub fetch_batch_size: usize,

    /// Idle sleep when a partition is caught up, in milliseconds
    pub poll_interval_ms: u64,

    pub stash_max_per_key: usize,
    pub stash_max_total: usize,
    pub stash_max_age_secs: u64,

    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,

    /// Deployment environment name; `production` disables rebuilds
    pub environment: String,

    pub allow_rebuild: bool,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            db_path: "data/orderview.db".to_string(),
            schema_dir: "sql".to_string(),
            stream_dir: "streams/orders".to_string(),
            partitions: 4,
            fetch_batch_size: 256,
            poll_interval_ms: 200,
            stash_max_per_key: 100,
            stash_max_total: 10_000,
            stash_max_age_secs: 600,
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
            environment: "development".to_string(),
            allow_rebuild: false,
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ProjectorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ORDERVIEW_DB_PATH` (default: data/orderview.db)
    /// - `ORDERVIEW_SCHEMA_DIR` (default: sql)
    /// - `ORDERVIEW_STREAM_DIR` (default: streams/orders)
    /// - `ORDERVIEW_PARTITIONS` (default: 4)
    /// - `FETCH_BATCH_SIZE` (default: 256)
    /// - `POLL_INTERVAL_MS` (default: 200)
    /// - `STASH_MAX_PER_KEY` (default: 100)
    /// - `STASH_MAX_TOTAL` (default: 10000)
    /// - `STASH_MAX_AGE_SECS` (default: 600)
    /// - `BACKOFF_INITIAL_MS` (default: 100)
    /// - `BACKOFF_MAX_MS` (default: 30000)
    /// - `ORDERVIEW_ENV` (default: development)
    /// - `ALLOW_REBUILD` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env::var("ORDERVIEW_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: env::var("ORDERVIEW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            stream_dir: env::var("ORDERVIEW_STREAM_DIR").unwrap_or(defaults.stream_dir),
            partitions: parsed("ORDERVIEW_PARTITIONS", defaults.partitions),
            fetch_batch_size: parsed("FETCH_BATCH_SIZE", defaults.fetch_batch_size),
            poll_interval_ms: parsed("POLL_INTERVAL_MS", defaults.poll_interval_ms),
            stash_max_per_key: parsed("STASH_MAX_PER_KEY", defaults.stash_max_per_key),
            stash_max_total: parsed("STASH_MAX_TOTAL", defaults.stash_max_total),
            stash_max_age_secs: parsed("STASH_MAX_AGE_SECS", defaults.stash_max_age_secs),
            backoff_initial_ms: parsed("BACKOFF_INITIAL_MS", defaults.backoff_initial_ms),
            backoff_max_ms: parsed("BACKOFF_MAX_MS", defaults.backoff_max_ms),
            environment: env::var("ORDERVIEW_ENV").unwrap_or(defaults.environment),
            allow_rebuild: parsed("ALLOW_REBUILD", defaults.allow_rebuild),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ORDERVIEW_PARTITIONS", self.partitions as u64),
            ("FETCH_BATCH_SIZE", self.fetch_batch_size as u64),
            ("STASH_MAX_PER_KEY", self.stash_max_per_key as u64),
            ("STASH_MAX_TOTAL", self.stash_max_total as u64),
            ("STASH_MAX_AGE_SECS", self.stash_max_age_secs),
            ("BACKOFF_INITIAL_MS", self.backoff_initial_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(ConfigError::BackoffRange {
                initial: self.backoff_initial_ms,
                max: self.backoff_max_ms,
            });
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            fetch_batch_size: self.fetch_batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff_initial_ms: self.backoff_initial_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    pub fn stash_limits(&self) -> StashLimits {
        StashLimits {
            max_per_key: self.stash_max_per_key,
            max_total: self.stash_max_total,
            max_age: chrono::Duration::seconds(self.stash_max_age_secs as i64),
        }
    }

    pub fn rebuild_gate(&self) -> RebuildGate {
        RebuildGate {
            environment: self.environment.clone(),
            allow_rebuild: self.allow_rebuild,
        }
    }
}
