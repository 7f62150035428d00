//! Singleton worker supervisor.
//!
//! [`Supervisor::ensure_worker_running`] is the one entry point callers use to
//! make sure a unit has its maintenance worker. Any number of callers may run
//! it concurrently for the same unit; the registry lock guarantees that only
//! one of them submits a launch request.
//!
//! # Locking
//!
//! ```text
//! lock ─▶ lookup-or-insert ─▶ started? ── yes ──▶ unlock ─▶ AlreadyStarted
//!                                 │
//!                                 no
//!                                 ▼
//!                     resolve owner, register ─▶ mark started ─▶ unlock
//!                                                                  │
//!                                          wait for startup (timed) ◀┘
//! ```
//!
//! The wait for startup happens after the lock is released, so a slow worker
//! never blocks callers asking about other units.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use maint_core::{DomainError, UnitId, WorkerView};

use crate::owner::{OwnerError, OwnerResolver};
use crate::procman::{LaunchError, ProcessManager, WorkerSignal, WorkerSpec};
use crate::registry::ControlBlock;

/// Result of a successful ensure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// This call launched the worker
    Launched { pid: u32 },
    /// A launch had already been requested
    AlreadyStarted,
}

/// Starts and tracks one maintenance worker per unit.
pub struct Supervisor {
    control: Arc<ControlBlock>,
    procman: Arc<dyn ProcessManager>,
    owners: Arc<dyn OwnerResolver>,
    restart_delay: Duration,
    startup_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        control: Arc<ControlBlock>,
        procman: Arc<dyn ProcessManager>,
        owners: Arc<dyn OwnerResolver>,
        restart_delay: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            control,
            procman,
            owners,
            restart_delay,
            startup_timeout,
        }
    }

    pub fn control(&self) -> &Arc<ControlBlock> {
        &self.control
    }

    pub fn procman(&self) -> &Arc<dyn ProcessManager> {
        &self.procman
    }

    /// Makes sure a maintenance worker has been requested for `unit`.
    ///
    /// On success a launch was requested by this call or an earlier one.
    /// Only the caller that performs the launch waits for startup.
    ///
    /// # Errors
    ///
    /// - `SlotExhaustion` when `unit` is new and the registry is full
    /// - `OwnerUnresolved` / `LaunchRequestFailed` leave the unit unstarted,
    ///   so a later call retries
    /// - `StartupFailed` when the launched worker does not confirm in time;
    ///   the unit stays started and the process manager keeps restarting it
    pub async fn ensure_worker_running(&self, unit: UnitId) -> Result<Ensured, SupervisorError> {
        let handle = {
            let mut table = self.control.lock().await;
            let (record, found) = table.enter(unit).map_err(|e| match e {
                DomainError::TableFull { capacity } => SupervisorError::SlotExhaustion {
                    max: capacity,
                },
                other => SupervisorError::Registry(other),
            })?;

            if record.is_started() {
                debug!(unit = %unit, "Maintenance worker already requested");
                return Ok(Ensured::AlreadyStarted);
            }
            if !found {
                debug!(unit = %unit, "Unit registered");
            }

            let owner = self
                .owners
                .owner_of(unit)
                .map_err(|source| SupervisorError::OwnerUnresolved { unit, source })?;
            let spec = WorkerSpec::maintenance(unit, owner, self.restart_delay);

            let handle = self
                .procman
                .register_worker(spec)
                .await
                .map_err(|source| SupervisorError::LaunchRequestFailed { unit, source })?;

            record.mark_started();
            info!(
                unit = %unit,
                owner = %owner,
                slot = handle.slot(),
                "Maintenance worker launch requested"
            );
            handle
        };

        match timeout(self.startup_timeout, self.procman.wait_for_startup(handle)).await {
            Ok(Ok(pid)) => {
                info!(unit = %unit, pid, "Maintenance worker running");
                Ok(Ensured::Launched { pid })
            }
            Ok(Err(e)) => {
                warn!(unit = %unit, error = %e, "Maintenance worker failed to start");
                Err(SupervisorError::StartupFailed {
                    unit,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    unit = %unit,
                    timeout_secs = self.startup_timeout.as_secs(),
                    "Timed out waiting for maintenance worker"
                );
                Err(SupervisorError::StartupFailed {
                    unit,
                    reason: format!("no startup confirmation within {:?}", self.startup_timeout),
                })
            }
        }
    }

    /// Registry records joined with the process manager's view of each unit.
    pub async fn list_workers(&self) -> Vec<WorkerView> {
        let records = self.control.records().await;
        let statuses = self.procman.snapshot().await;

        records
            .iter()
            .map(|record| {
                let mut view = record.view();
                view.pid = statuses
                    .iter()
                    .find(|s| s.unit == record.unit_id())
                    .and_then(|s| s.state.pid());
                view
            })
            .collect()
    }

    /// Asks the worker of `unit` to run a cycle now.
    pub async fn wake(&self, unit: UnitId) -> usize {
        self.procman
            .signal_workers(Some(unit), WorkerSignal::Wake)
            .await
    }

    /// Asks every worker to reload its configuration.
    pub async fn reload_all(&self) -> usize {
        self.procman.signal_workers(None, WorkerSignal::Reload).await
    }
}

/// Errors returned by the supervisor entry point.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error(
        "could not find a free maintenance worker slot (max_worker_slots = {max}); \
         raise max_worker_slots in the daemon config"
    )]
    SlotExhaustion { max: usize },

    #[error("could not register maintenance worker for unit {unit}: {source}")]
    LaunchRequestFailed {
        unit: UnitId,
        #[source]
        source: LaunchError,
    },

    #[error("maintenance worker for unit {unit} did not start: {reason}")]
    StartupFailed { unit: UnitId, reason: String },

    #[error("cannot resolve owner of unit {unit}: {source}")]
    OwnerUnresolved {
        unit: UnitId,
        #[source]
        source: OwnerError,
    },

    #[error("registry error: {0}")]
    Registry(DomainError),
}

impl SupervisorError {
    /// Stable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SlotExhaustion { .. } => "slot_exhaustion",
            Self::LaunchRequestFailed { .. } => "launch_request_failed",
            Self::StartupFailed { .. } => "startup_failed",
            Self::OwnerUnresolved { .. } => "owner_unresolved",
            Self::Registry(_) => "registry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_exhaustion_message_names_setting() {
        let err = SupervisorError::SlotExhaustion { max: 2 };
        let msg = err.to_string();
        assert!(msg.contains("max_worker_slots"));
        assert!(msg.contains('2'));
        assert_eq!(err.code(), "slot_exhaustion");
    }

    #[test]
    fn test_error_codes() {
        let unit = UnitId::new(1);
        assert_eq!(
            SupervisorError::LaunchRequestFailed {
                unit,
                source: LaunchError::NoFreeSlot { max: 1 },
            }
            .code(),
            "launch_request_failed"
        );
        assert_eq!(
            SupervisorError::StartupFailed {
                unit,
                reason: String::new(),
            }
            .code(),
            "startup_failed"
        );
        assert_eq!(
            SupervisorError::OwnerUnresolved {
                unit,
                source: OwnerError::Unknown(unit),
            }
            .code(),
            "owner_unresolved"
        );
    }
}
