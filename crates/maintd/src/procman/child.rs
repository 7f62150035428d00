//! Process manager that runs each worker as a child OS process.
//!
//! Every registered worker gets a slot and a supervising task. The task
//! waits for the host to reach the worker's start phase, spawns the worker
//! command, reads the startup handshake from its stdout and, under
//! `RestartPolicy::After`, relaunches it after every exit.
//!
//! The worker's stdin is a pipe the host never writes to. When the host
//! goes away the pipe closes and the worker sees EOF; that is its host-death
//! signal.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Spawn and handshake failures become `WorkerState::Failed`

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maint_core::UnitId;
use maint_protocol::WorkerReport;

use super::{
    HostPhase, LaunchError, ProcessManager, RestartPolicy, WorkerHandle, WorkerSignal, WorkerSpec,
    WorkerState, WorkerStatus,
};

/// Time a worker gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Program and leading arguments used to start a worker.
///
/// The manager appends `--entry <e> --unit <id> --extra <hex>`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable's `worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    fn build(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--entry")
            .arg(spec.entry.as_str())
            .arg("--unit")
            .arg(spec.main_arg.to_string())
            .arg("--extra")
            .arg(spec.extra.to_hex())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

// ============================================================================
// Slots
// ============================================================================

struct SlotEntry {
    unit: UnitId,
    name: String,
    state: watch::Receiver<WorkerState>,
    restarts: u32,
}

type SlotTable = Arc<Mutex<Vec<Option<SlotEntry>>>>;

/// Everything a slot's supervising task needs.
struct SlotTask {
    index: usize,
    spec: WorkerSpec,
    command: WorkerCommand,
    state: watch::Sender<WorkerState>,
    phase: watch::Receiver<HostPhase>,
    cancel: CancellationToken,
    stop_grace: Duration,
    slots: SlotTable,
}

/// How one launch of a worker ended.
enum LaunchOutcome {
    Exited(ExitStatus),
    Failed(String),
    Cancelled,
}

// ============================================================================
// Child Process Manager
// ============================================================================

/// Runs workers as child processes of the host.
pub struct ChildProcessManager {
    command: WorkerCommand,
    max_workers: usize,
    phase: watch::Receiver<HostPhase>,
    cancel: CancellationToken,
    stop_grace: Duration,
    slots: SlotTable,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChildProcessManager {
    /// Creates a manager with `max_workers` slots.
    ///
    /// Workers start once `phase` reaches their start phase. Cancelling
    /// `cancel` stops every worker.
    pub fn new(
        command: WorkerCommand,
        max_workers: usize,
        phase: watch::Receiver<HostPhase>,
        cancel: CancellationToken,
    ) -> Self {
        let slots = (0..max_workers).map(|_| None).collect();
        Self {
            command,
            max_workers,
            phase,
            cancel,
            stop_grace: DEFAULT_STOP_GRACE,
            slots: Arc::new(Mutex::new(slots)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of occupied slots.
    pub async fn active(&self) -> usize {
        self.slots.lock().await.iter().flatten().count()
    }

    /// Stops every worker and waits for their supervising tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        debug!("Process manager shut down");
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    async fn register_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        if self.cancel.is_cancelled() {
            return Err(LaunchError::ShuttingDown);
        }
        spec.validate()?;

        let (tx, rx) = watch::channel(WorkerState::Pending);
        let index = {
            let mut slots = self.slots.lock().await;
            let index = slots
                .iter()
                .position(Option::is_none)
                .ok_or(LaunchError::NoFreeSlot {
                    max: self.max_workers,
                })?;
            slots[index] = Some(SlotEntry {
                unit: spec.main_arg,
                name: spec.name.clone(),
                state: rx.clone(),
                restarts: 0,
            });
            index
        };

        info!(slot = index, unit = %spec.main_arg, name = %spec.name, "Worker registered");

        let unit = spec.main_arg;
        let task = SlotTask {
            index,
            spec,
            command: self.command.clone(),
            state: tx,
            phase: self.phase.clone(),
            cancel: self.cancel.clone(),
            stop_grace: self.stop_grace,
            slots: Arc::clone(&self.slots),
        };
        let join = tokio::spawn(task.run());

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(join);

        Ok(WorkerHandle::new(index, unit, rx))
    }

    async fn snapshot(&self) -> Vec<WorkerStatus> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().map(|e| WorkerStatus {
                    slot,
                    unit: e.unit,
                    name: e.name.clone(),
                    state: e.state.borrow().clone(),
                    restarts: e.restarts,
                })
            })
            .collect()
    }

    async fn signal_workers(&self, unit: Option<UnitId>, signal: WorkerSignal) -> usize {
        let pids: Vec<u32> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .flatten()
                .filter(|e| unit.map_or(true, |u| u == e.unit))
                .filter_map(|e| e.state.borrow().pid())
                .collect()
        };

        pids.into_iter()
            .filter(|&pid| match send_signal(pid, signal.as_raw()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(pid, error = %e, "Failed to signal worker");
                    false
                }
            })
            .count()
    }
}

impl SlotTask {
    async fn run(mut self) {
        if self.wait_for_phase().await {
            self.supervise().await;
        }

        // A final launch failure stays visible until the sender drops
        if !matches!(*self.state.borrow(), WorkerState::Failed { .. }) {
            self.state.send_replace(WorkerState::Stopped);
        }
        let mut slots = self.slots.lock().await;
        if let Some(entry) = slots.get_mut(self.index) {
            *entry = None;
        }
        debug!(slot = self.index, unit = %self.spec.main_arg, "Worker slot released");
    }

    /// Returns false if the host shut down first.
    async fn wait_for_phase(&mut self) -> bool {
        loop {
            if *self.phase.borrow_and_update() >= self.spec.start_phase {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.phase.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn supervise(&mut self) {
        loop {
            match self.launch_once().await {
                LaunchOutcome::Cancelled => return,
                LaunchOutcome::Exited(status) => {
                    info!(unit = %self.spec.main_arg, %status, "Worker exited");
                    self.state.send_replace(WorkerState::Pending);
                }
                LaunchOutcome::Failed(reason) => {
                    warn!(unit = %self.spec.main_arg, reason = %reason, "Worker launch failed");
                    self.state.send_replace(WorkerState::Failed { reason });
                }
            }

            let delay = match self.spec.restart {
                RestartPolicy::Never => return,
                RestartPolicy::After(delay) => delay,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let mut slots = self.slots.lock().await;
            if let Some(Some(entry)) = slots.get_mut(self.index) {
                entry.restarts = entry.restarts.saturating_add(1);
            }
            drop(slots);
            info!(unit = %self.spec.main_arg, delay_secs = delay.as_secs(), "Restarting worker");
        }
    }

    async fn launch_once(&mut self) -> LaunchOutcome {
        let mut child = match self.command.build(&self.spec).spawn() {
            Ok(child) => child,
            Err(e) => return LaunchOutcome::Failed(format!("spawn failed: {e}")),
        };
        // Held open for the worker's lifetime; dropping it signals host death
        let _host_pipe = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            self.stop(&mut child).await;
            return LaunchOutcome::Failed("worker stdout not captured".to_string());
        };
        let Some(pid) = child.id().filter(|&pid| pid > 0) else {
            self.stop(&mut child).await;
            return LaunchOutcome::Failed("worker exited before its pid was known".to_string());
        };
        let mut lines = BufReader::new(stdout).lines();

        let handshake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.stop(&mut child).await;
                return LaunchOutcome::Cancelled;
            }
            line = lines.next_line() => read_handshake(line, self.spec.main_arg),
            status = child.wait() => {
                return match status {
                    Ok(status) => LaunchOutcome::Failed(format!("exited before handshake ({status})")),
                    Err(e) => LaunchOutcome::Failed(e.to_string()),
                };
            }
        };

        if let Err(reason) = handshake {
            self.stop(&mut child).await;
            return LaunchOutcome::Failed(reason);
        }

        info!(unit = %self.spec.main_arg, pid, "Worker started");
        self.state.send_replace(WorkerState::Running { pid });

        self.watch_running(&mut child, &mut lines).await
    }

    /// Waits for a running worker to exit, draining any further stdout.
    async fn watch_running(
        &mut self,
        child: &mut Child,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> LaunchOutcome {
        let mut stdout_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.stop(child).await;
                    return LaunchOutcome::Cancelled;
                }
                status = child.wait() => {
                    return match status {
                        Ok(status) => LaunchOutcome::Exited(status),
                        Err(e) => LaunchOutcome::Failed(e.to_string()),
                    };
                }
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => debug!(unit = %self.spec.main_arg, line = %line, "Worker stdout"),
                    _ => stdout_open = false,
                },
            }
        }
    }

    /// SIGTERM, then kill after the grace period.
    async fn stop(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(e) = send_signal(pid, libc::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        match timeout(self.stop_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(unit = %self.spec.main_arg, "Worker ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

fn read_handshake(line: io::Result<Option<String>>, unit: UnitId) -> Result<(), String> {
    let line = match line {
        Ok(Some(line)) => line,
        Ok(None) => return Err("worker closed stdout before handshake".to_string()),
        Err(e) => return Err(e.to_string()),
    };
    match WorkerReport::parse_line(&line).map_err(|e| e.to_string())? {
        WorkerReport::Ready { unit: reported, .. } if reported == unit => Ok(()),
        WorkerReport::Ready { unit: reported, .. } => Err(format!(
            "worker reported unit {reported}, expected {unit}"
        )),
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    // kill(0, ..) would signal the daemon's own process group
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|&pid| pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
