//! Runs the real `maintd worker` binary.
//!
//! Covers the process-level contract: one handshake line on stdout, then exit
//! status 0 on SIGTERM, 1 when the host pipe closes and 2 when startup fails.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use maint_core::{PrincipalId, UnitId, WorkerPayload};
use maint_protocol::WorkerReport;
use maintd::procman::{
    ChildProcessManager, HostPhase, ProcessManager, RestartPolicy, WorkerCommand, WorkerSpec,
    WorkerState,
};

const MAINTD: &str = env!("CARGO_BIN_EXE_maintd");

/// Naptime written to the worker's config.
const NAPTIME: Duration = Duration::from_millis(2000);

const STARTUP_WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Writes a config file with `naptime` and returns its directory.
fn config_dir(naptime: Duration) -> TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(
        dir.path().join("config.toml"),
        format!("naptime_ms = {}\n", naptime.as_millis()),
    )
    .unwrap();
    dir
}

fn worker_command(config: &Path, unit: u32, extra: &str) -> Command {
    let mut cmd = Command::new(MAINTD);
    cmd.arg("worker")
        .arg("--config")
        .arg(config.join("config.toml"))
        .arg("--entry")
        .arg("maintenance")
        .arg("--unit")
        .arg(unit.to_string())
        .arg("--extra")
        .arg(extra)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

fn payload(principal: u32) -> String {
    WorkerPayload::from_principal(PrincipalId::new(principal)).to_hex()
}

/// Spawns a worker and reads its handshake line.
///
/// The returned stdin is the host pipe; dropping it tells the worker the host died.
async fn spawn_ready(config: &Path, unit: u32) -> (Child, ChildStdin, u32) {
    let mut child = worker_command(config, unit, &payload(10)).spawn().unwrap();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();

    let mut lines = BufReader::new(stdout).lines();
    let line = timeout(STARTUP_WAIT, lines.next_line())
        .await
        .expect("handshake in time")
        .unwrap()
        .expect("handshake line");

    let pid = child.id().unwrap();
    assert_eq!(
        WorkerReport::parse_line(&line).unwrap(),
        WorkerReport::ready(UnitId::new(unit), pid)
    );
    (child, stdin, pid)
}

async fn exit_within(child: &mut Child, limit: Duration) -> ExitStatus {
    timeout(limit, child.wait())
        .await
        .expect("worker exited in time")
        .unwrap()
}

fn sigterm(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) }, 0);
}

// ============================================================================
// Exit Codes
// ============================================================================

#[tokio::test]
async fn test_sigterm_exits_zero_within_naptime() {
    let config = config_dir(NAPTIME);
    let (mut child, _host_pipe, pid) = spawn_ready(config.path(), 7).await;

    sigterm(pid);
    let status = exit_within(&mut child, NAPTIME).await;
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn test_host_pipe_close_exits_one() {
    // Far longer than the test waits, so only host death can end the loop
    let config = config_dir(Duration::from_secs(600));
    let (mut child, host_pipe, _pid) = spawn_ready(config.path(), 8).await;

    drop(host_pipe);
    let status = exit_within(&mut child, NAPTIME).await;
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn test_invalid_payload_exits_two() {
    let config = config_dir(NAPTIME);
    let mut child = worker_command(config.path(), 9, "not-hex").spawn().unwrap();

    let status = exit_within(&mut child, STARTUP_WAIT).await;
    assert_eq!(status.code(), Some(2));
}

#[tokio::test]
async fn test_missing_principal_exits_two_without_handshake() {
    let config = config_dir(NAPTIME);
    let mut child = worker_command(config.path(), 9, &payload(0)).spawn().unwrap();
    let stdout = child.stdout.take().unwrap();

    let status = exit_within(&mut child, STARTUP_WAIT).await;
    assert_eq!(status.code(), Some(2));

    let mut lines = BufReader::new(stdout).lines();
    assert_eq!(lines.next_line().await.unwrap(), None);
}

// ============================================================================
// Under the Process Manager
// ============================================================================

#[tokio::test]
async fn test_manager_shutdown_does_not_wait_out_grace() {
    let config = config_dir(Duration::from_secs(600));
    let grace = Duration::from_secs(10);

    let (_phase, phase_rx) = watch::channel(HostPhase::ConsistentState);
    let command = WorkerCommand::new(MAINTD)
        .arg("worker")
        .arg("--config")
        .arg(config.path().join("config.toml"));
    let manager = Arc::new(
        ChildProcessManager::new(command, 1, phase_rx, CancellationToken::new())
            .with_stop_grace(grace),
    );

    let mut spec = WorkerSpec::maintenance(
        UnitId::new(21),
        PrincipalId::new(10),
        Duration::from_secs(600),
    );
    spec.restart = RestartPolicy::Never;
    let handle = manager.register_worker(spec).await.unwrap();
    let pid = timeout(STARTUP_WAIT, manager.wait_for_startup(handle.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(pid > 0);

    let started = Instant::now();
    timeout(grace * 2, manager.shutdown())
        .await
        .expect("shutdown completes");
    assert!(
        started.elapsed() < grace,
        "worker ignored SIGTERM, shutdown took {:?}",
        started.elapsed()
    );
    assert_eq!(handle.state(), WorkerState::Stopped);
}
