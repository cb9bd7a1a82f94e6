//! Destructive full replay: halt workers, wipe the view and stash, rewind offsets
//!
//! One rebuild at a time. `pause`/`resume` take the same lock, so a resume can
//! never release workers into a half-truncated store.

use crate::ingest::{ControlPlane, RunState};
use crate::stash::Stash;
use crate::store::{CheckpointStore, SharedConnection, StoreError, ViewStore};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("rebuild is disabled in environment '{environment}'")]
    Forbidden { environment: String },

    #[error("a rebuild is already in progress")]
    InProgress,

    #[error("rebuild storage step failed: {0}")]
    Store(#[from] StoreError),
}

/// Who may trigger a rebuild
#[derive(Debug, Clone)]
pub struct RebuildGate {
    pub environment: String,
    pub allow_rebuild: bool,
}

impl RebuildGate {
    pub fn permits(&self) -> bool {
        self.allow_rebuild && !self.environment.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub partitions: Vec<u32>,
    pub stash_entries_removed: usize,
}

pub struct RebuildController {
    control: Arc<ControlPlane>,
    views: Arc<dyn ViewStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    conn: SharedConnection,
    gate: RebuildGate,
    lock: Mutex<()>,
}

impl RebuildController {
    pub fn new(
        control: Arc<ControlPlane>,
        views: Arc<dyn ViewStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        conn: SharedConnection,
        gate: RebuildGate,
    ) -> Self {
        Self {
            control,
            views,
            checkpoints,
            conn,
            gate,
            lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> RunState {
        self.control.state()
    }

    /// Stop consuming once in-flight events have committed
    pub async fn pause(&self) {
        let _guard = self.lock.lock().await;
        self.control.set_state(RunState::Paused);
        self.control.wait_halted().await;
    }

    pub async fn resume(&self) {
        let _guard = self.lock.lock().await;
        self.control.set_state(RunState::Running);
    }

    /// Wipe the view and stash, rewind every owned partition, and resume.
    ///
    /// On a storage failure the workers stay paused and the error is returned;
    /// calling `rebuild` again restarts the whole sequence.
    pub async fn rebuild(&self) -> Result<RebuildReport, RebuildError> {
        if !self.gate.permits() {
            log::warn!(
                "🚫 Rebuild refused (environment: {}, allow_rebuild: {})",
                self.gate.environment,
                self.gate.allow_rebuild
            );
            return Err(RebuildError::Forbidden {
                environment: self.gate.environment.clone(),
            });
        }

        let _guard = self.lock.try_lock().map_err(|_| RebuildError::InProgress)?;

        log::info!("🏗️  Rebuild started");
        self.control.set_state(RunState::Rebuilding);
        self.control.wait_halted().await;

        let partitions = self.control.partitions();
        let result = self.reset_storage(&partitions).await;

        match result {
            Ok(stash_entries_removed) => {
                self.control.set_state(RunState::Running);
                log::info!(
                    "✅ Rebuild reset complete, replaying {} partitions from the start",
                    partitions.len()
                );
                Ok(RebuildReport {
                    partitions,
                    stash_entries_removed,
                })
            }
            Err(e) => {
                self.control.set_state(RunState::Paused);
                log::error!("❌ Rebuild failed, workers left paused: {}", e);
                Err(e.into())
            }
        }
    }

    async fn reset_storage(&self, partitions: &[u32]) -> Result<usize, StoreError> {
        self.views.truncate().await?;
        let removed = Stash::truncate_all(&self.conn)?;
        self.checkpoints.reset(partitions).await?;
        Ok(removed)
    }
}
