//! Run-state signalling between the rebuild controller and partition workers
//!
//! The controller publishes the commanded `RunState` on a watch channel; each
//! worker publishes its own `WorkerPhase` back, tagged with the command epoch it
//! observed so a stale `Halted` from an earlier pause never satisfies a new one.
//! Workers only look at the command between events, so a halt always lands
//! after a complete write-then-commit.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Rebuilding,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Rebuilding => "rebuilding",
        }
    }
}

/// What a worker reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Consuming, or about to
    Active,
    /// Parked between events, nothing in flight
    Halted,
    /// Exited its loop
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Command {
    state: RunState,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerStatus {
    phase: WorkerPhase,
    epoch: u64,
}

pub struct ControlPlane {
    command: watch::Sender<Command>,
    shutdown: watch::Sender<bool>,
    phases: Vec<(u32, watch::Receiver<WorkerStatus>)>,
}

impl ControlPlane {
    pub fn new() -> Self {
        let (command, _) = watch::channel(Command {
            state: RunState::Running,
            epoch: 0,
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            command,
            shutdown,
            phases: Vec::new(),
        }
    }

    /// Handle for the worker owning `partition`
    pub fn register(&mut self, partition: u32) -> WorkerControl {
        let (phase, phase_rx) = watch::channel(WorkerStatus {
            phase: WorkerPhase::Active,
            epoch: self.command.borrow().epoch,
        });
        self.phases.push((partition, phase_rx));
        WorkerControl {
            partition,
            command: self.command.subscribe(),
            shutdown: self.shutdown.subscribe(),
            phase,
            orphaned: false,
        }
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.phases.iter().map(|(partition, _)| *partition).collect()
    }

    pub fn state(&self) -> RunState {
        self.command.borrow().state
    }

    pub fn set_state(&self, state: RunState) {
        let mut previous = state;
        self.command.send_modify(|command| {
            previous = command.state;
            command.state = state;
            command.epoch += 1;
        });
        if previous != state {
            log::info!(
                "🔀 Run state: {} → {}",
                previous.as_str(),
                state.as_str()
            );
        }
    }

    /// Wait until every worker has seen the current command and parked.
    /// Only meaningful after commanding a non-running state.
    pub async fn wait_halted(&self) {
        let target = self.command.borrow().epoch;
        for (partition, status) in &self.phases {
            let mut status = status.clone();
            // A dropped sender means the worker is gone
            let _ = status
                .wait_for(|s| {
                    s.phase == WorkerPhase::Stopped
                        || (s.phase == WorkerPhase::Halted && s.epoch >= target)
                })
                .await;
            log::debug!("Partition {} halted", partition);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerControl {
    partition: u32,
    command: watch::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    phase: watch::Sender<WorkerStatus>,
    /// Control plane dropped without a shutdown
    orphaned: bool,
}

impl WorkerControl {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn should_run(&self) -> bool {
        !self.is_shutdown() && self.command.borrow().state == RunState::Running
    }

    pub fn is_shutdown(&self) -> bool {
        self.orphaned || *self.shutdown.borrow()
    }

    pub fn report(&self, phase: WorkerPhase) {
        let epoch = self.command.borrow().epoch;
        self.phase.send_replace(WorkerStatus { phase, epoch });
    }

    /// Park until commanded back to `Running`. Returns false on shutdown.
    pub async fn wait_until_running(&mut self) -> bool {
        log::info!("⏸️  Partition {} halted", self.partition);

        loop {
            if self.is_shutdown() {
                return false;
            }
            let command = *self.command.borrow_and_update();
            if command.state == RunState::Running {
                self.phase.send_replace(WorkerStatus {
                    phase: WorkerPhase::Active,
                    epoch: command.epoch,
                });
                log::info!("▶️  Partition {} resuming", self.partition);
                return true;
            }
            self.phase.send_replace(WorkerStatus {
                phase: WorkerPhase::Halted,
                epoch: command.epoch,
            });

            tokio::select! {
                changed = self.command.changed() => {
                    if changed.is_err() {
                        self.orphaned = true;
                        return false;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        self.orphaned = true;
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`, waking early if the command or shutdown flag changes
    pub async fn sleep(&mut self, duration: Duration) {
        let closed = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.command.changed() => changed.is_err(),
            changed = self.shutdown.changed() => changed.is_err(),
        };
        if closed {
            self.orphaned = true;
        }
        self.command.borrow_and_update();
        self.shutdown.borrow_and_update();
    }
}
