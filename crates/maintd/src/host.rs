//! Host assembly: wires configuration, shared memory, the process manager
//! and the supervisor together in startup order.
//!
//! ```text
//! config ─▶ request registry space ─▶ start arena (hooks run)
//!        ─▶ process manager ─▶ phase = ConsistentState ─▶ supervisor
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::owner::{ConfigOwners, OwnerResolver};
use crate::procman::{ChildProcessManager, HostPhase, ProcessManager, WorkerCommand};
use crate::registry::{self, ControlBlock};
use crate::shmem::{HostSetup, SharedArena, ShmemError};
use crate::supervisor::Supervisor;

/// A started host.
pub struct Host {
    arena: Arc<SharedArena>,
    supervisor: Arc<Supervisor>,
    procman: Arc<ChildProcessManager>,
    owners: Arc<ConfigOwners>,
    phase: watch::Sender<HostPhase>,
}

impl Host {
    /// Starts the host. Workers spawned by the process manager run
    /// `command`; they stop when `cancel` fires.
    pub fn start(
        config: &DaemonConfig,
        command: WorkerCommand,
        cancel: CancellationToken,
    ) -> Result<Self, ShmemError> {
        let mut setup = HostSetup::new();
        registry::request_shmem(&mut setup, config.max_worker_slots);
        let arena = setup.start()?;
        let control = ControlBlock::attach(&arena, config.max_worker_slots)?;

        let (phase, phase_rx) = watch::channel(HostPhase::Startup);
        let procman = Arc::new(ChildProcessManager::new(
            command,
            config.max_worker_processes,
            phase_rx,
            cancel,
        ));
        let owners = Arc::new(ConfigOwners::new(config.clone()));

        let supervisor = Arc::new(Supervisor::new(
            control,
            Arc::clone(&procman) as Arc<dyn ProcessManager>,
            Arc::clone(&owners) as Arc<dyn OwnerResolver>,
            config.restart_delay(),
            config.startup_timeout(),
        ));

        phase.send_replace(HostPhase::ConsistentState);
        info!(
            slots = config.max_worker_slots,
            processes = config.max_worker_processes,
            "Host reached consistent state"
        );

        Ok(Self {
            arena,
            supervisor,
            procman,
            owners,
            phase,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    pub fn phase(&self) -> HostPhase {
        *self.phase.borrow()
    }

    /// Applies a reloaded configuration and forwards the reload to workers.
    ///
    /// Only the owner table is reloadable in the host; capacity settings
    /// need a restart.
    pub async fn reload(&self, config: DaemonConfig) -> usize {
        if let Err(e) = self.owners.replace(config) {
            warn!(error = %e, "Owner table not reloaded");
        }
        self.supervisor.reload_all().await
    }

    /// Stops all workers.
    pub async fn shutdown(&self) {
        self.procman.shutdown().await;
    }
}
