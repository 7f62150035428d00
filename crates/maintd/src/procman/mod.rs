//! Host process manager interface.
//!
//! The supervisor never spawns processes itself. It describes the worker it
//! wants in a [`WorkerSpec`] and hands that to a [`ProcessManager`], which
//! owns slots, start-phase gating, restarts and signal delivery.
//!
//! [`ChildProcessManager`] is the implementation used by the daemon; tests
//! plug in their own.

mod child;

pub use child::{ChildProcessManager, WorkerCommand, DEFAULT_STOP_GRACE};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use maint_core::{PrincipalId, UnitId, WorkerPayload};

// ============================================================================
// Worker Spec
// ============================================================================

/// Host lifecycle phase a worker may start in.
///
/// Ordered: a worker whose start phase is `ConsistentState` runs once the host
/// reaches `ConsistentState` or any later phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Startup,
    ConsistentState,
    RecoveryFinished,
}

/// Capabilities a worker asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerFlags {
    pub shmem_access: bool,
    /// Worker connects to its unit as the principal in its payload
    pub unit_connection: bool,
}

/// What the process manager does when a worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    After(Duration),
}

/// Named entry point the worker binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Maintenance,
}

impl EntryPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPoint {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maintenance" => Ok(Self::Maintenance),
            other => Err(LaunchError::InvalidSpec(format!(
                "unknown entry point '{other}'"
            ))),
        }
    }
}

/// Launch request submitted to the process manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub flags: WorkerFlags,
    pub start_phase: HostPhase,
    pub restart: RestartPolicy,
    pub entry: EntryPoint,
    /// Unit the worker serves
    pub main_arg: UnitId,
    /// Opaque payload; carries the owning principal
    pub extra: WorkerPayload,
    /// Process to tell about startup, if any
    pub notify_pid: Option<u32>,
}

impl WorkerSpec {
    /// Maintenance worker for `unit`, running as `owner`.
    pub fn maintenance(unit: UnitId, owner: PrincipalId, restart_delay: Duration) -> Self {
        Self {
            name: format!("maintenance daemon: unit {unit}"),
            flags: WorkerFlags {
                shmem_access: true,
                unit_connection: true,
            },
            start_phase: HostPhase::ConsistentState,
            restart: RestartPolicy::After(restart_delay),
            entry: EntryPoint::Maintenance,
            main_arg: unit,
            extra: WorkerPayload::from_principal(owner),
            notify_pid: Some(std::process::id()),
        }
    }

    /// Checks the spec is one the host can run.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.name.trim().is_empty() {
            return Err(LaunchError::InvalidSpec("worker name is empty".to_string()));
        }
        if self.flags.unit_connection && !self.flags.shmem_access {
            return Err(LaunchError::InvalidSpec(
                "unit connection requires shared memory access".to_string(),
            ));
        }
        if self.flags.unit_connection && self.start_phase < HostPhase::ConsistentState {
            return Err(LaunchError::InvalidSpec(
                "unit connection cannot start before consistent state".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Worker Handles
// ============================================================================

/// Observable state of a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered, not (yet or again) running
    Pending,
    Running { pid: u32 },
    /// Slot released; the worker will not run again
    Stopped,
    /// Last launch attempt failed; a restart may follow
    Failed { reason: String },
}

impl WorkerState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid } => Some(*pid),
            _ => None,
        }
    }
}

/// Handle to a registered worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    slot: usize,
    unit: UnitId,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn new(slot: usize, unit: UnitId, state: watch::Receiver<WorkerState>) -> Self {
        Self { slot, unit, state }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    /// Waits until the worker reports it is running.
    ///
    /// A failed launch with a pending restart keeps waiting; only a released
    /// slot ends the wait early.
    pub async fn wait_running(&mut self) -> Result<u32, StartupError> {
        let mut last_failure = None;
        loop {
            let state = self.state.borrow_and_update().clone();
            match state {
                WorkerState::Running { pid } => return Ok(pid),
                WorkerState::Stopped => break,
                WorkerState::Failed { reason } => last_failure = Some(reason),
                WorkerState::Pending => {}
            }
            if self.state.changed().await.is_err() {
                break;
            }
        }
        Err(match last_failure {
            Some(reason) => StartupError::HandshakeFailed(reason),
            None => StartupError::Stopped,
        })
    }
}

/// Signals the process manager can forward to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Re-read configuration (SIGHUP)
    Reload,
    /// Run a cycle now (SIGUSR1)
    Wake,
    /// Shut down (SIGTERM)
    Terminate,
}

impl WorkerSignal {
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Self::Reload => libc::SIGHUP,
            Self::Wake => libc::SIGUSR1,
            Self::Terminate => libc::SIGTERM,
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub slot: usize,
    pub unit: UnitId,
    pub name: String,
    pub state: WorkerState,
    pub restarts: u32,
}

// ============================================================================
// Process Manager
// ============================================================================

/// Launches and tracks worker processes on behalf of the host.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Submits a launch request. Returns once a slot is reserved; the worker
    /// itself starts asynchronously.
    async fn register_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle, LaunchError>;

    /// Waits for the worker behind `handle` to confirm startup.
    async fn wait_for_startup(&self, mut handle: WorkerHandle) -> Result<u32, StartupError> {
        handle.wait_running().await
    }

    /// Current state of every occupied slot.
    async fn snapshot(&self) -> Vec<WorkerStatus>;

    /// Sends `signal` to running workers of `unit`, or to all when `None`.
    /// Returns the number of processes signalled.
    async fn signal_workers(&self, unit: Option<UnitId>, signal: WorkerSignal) -> usize;
}

/// Launch request rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("no free worker process slot (max_worker_processes = {max})")]
    NoFreeSlot { max: usize },

    #[error("invalid worker spec: {0}")]
    InvalidSpec(String),

    #[error("process manager is shutting down")]
    ShuttingDown,
}

/// Worker did not confirm startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("worker stopped before starting")]
    Stopped,

    #[error("worker handshake failed: {0}")]
    HandshakeFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkerSpec {
        WorkerSpec::maintenance(UnitId::new(16384), PrincipalId::new(10), Duration::from_secs(5))
    }

    #[test]
    fn test_maintenance_spec() {
        let spec = spec();
        assert_eq!(spec.name, "maintenance daemon: unit 16384");
        assert!(spec.flags.shmem_access && spec.flags.unit_connection);
        assert_eq!(spec.start_phase, HostPhase::ConsistentState);
        assert_eq!(spec.restart, RestartPolicy::After(Duration::from_secs(5)));
        assert_eq!(spec.extra.principal(), PrincipalId::new(10));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_unit_connection_needs_consistent_state() {
        let mut spec = spec();
        spec.start_phase = HostPhase::Startup;
        assert!(matches!(spec.validate(), Err(LaunchError::InvalidSpec(_))));

        spec.flags.unit_connection = false;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_name_invalid() {
        let mut spec = spec();
        spec.name = "  ".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_phase_order() {
        assert!(HostPhase::Startup < HostPhase::ConsistentState);
        assert!(HostPhase::ConsistentState < HostPhase::RecoveryFinished);
    }

    #[test]
    fn test_entry_point_parse() {
        assert_eq!("maintenance".parse::<EntryPoint>(), Ok(EntryPoint::Maintenance));
        assert!("vacuum".parse::<EntryPoint>().is_err());
    }

    #[tokio::test]
    async fn test_wait_running_sees_restart_after_failure() {
        let (tx, rx) = watch::channel(WorkerState::Pending);
        let mut handle = WorkerHandle::new(0, UnitId::new(1), rx);

        tx.send_replace(WorkerState::Failed {
            reason: "exited".to_string(),
        });
        let waiter = tokio::spawn(async move { handle.wait_running().await });
        tokio::task::yield_now().await;
        tx.send_replace(WorkerState::Running { pid: 77 });

        assert_eq!(waiter.await.unwrap(), Ok(77));
    }

    #[tokio::test]
    async fn test_wait_running_stopped() {
        let (tx, rx) = watch::channel(WorkerState::Pending);
        let mut handle = WorkerHandle::new(0, UnitId::new(1), rx);
        drop(tx);
        assert_eq!(handle.wait_running().await, Err(StartupError::Stopped));
    }

    #[tokio::test]
    async fn test_wait_running_reports_last_failure() {
        let (tx, rx) = watch::channel(WorkerState::Failed {
            reason: "bad handshake".to_string(),
        });
        let mut handle = WorkerHandle::new(0, UnitId::new(1), rx);
        drop(tx);

        assert_eq!(
            handle.wait_running().await,
            Err(StartupError::HandshakeFailed("bad handshake".to_string()))
        );
    }
}
