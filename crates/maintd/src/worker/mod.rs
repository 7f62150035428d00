//! Maintenance worker process.
//!
//! [`run_worker`] is the body of `maintd worker`: the process the process
//! manager spawns for each unit. It installs its signal handlers, establishes
//! its working context, reports readiness on stdout and runs the
//! [`MaintenanceLoop`] until terminated or orphaned.
//!
//! # Channels to the host
//!
//! - stdin: never written by the host; EOF means the host died
//! - stdout: exactly one handshake line, nothing else
//! - stderr: logs
//!
//! # Exit codes
//!
//! | code | meaning                    |
//! |------|----------------------------|
//! | 0    | terminated on request      |
//! | 1    | host died                  |
//! | 2    | startup failed             |

pub mod context;
pub mod latch;
pub mod main_loop;
pub mod signals;

pub use context::WorkerContext;
pub use latch::Latch;
pub use main_loop::{
    ConfigSource, CycleHook, FileConfigSource, LogCycle, LoopExit, MaintenanceLoop, WorkerSettings,
};
pub use signals::{ReloadFlag, SignalBridge, SignalGuard};

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maint_core::{UnitId, WorkerPayload};
use maint_protocol::{HandshakeError, WorkerReport};

use crate::config::{ConfigError, DaemonConfig};
use crate::procman::EntryPoint;

pub const EXIT_TERMINATED: i32 = 0;
pub const EXIT_HOST_DIED: i32 = 1;
pub const EXIT_STARTUP_FAILED: i32 = 2;

/// Command-line arguments of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub entry: EntryPoint,
    pub unit: UnitId,
    pub extra: WorkerPayload,
    pub config: Option<PathBuf>,
}

/// Errors that stop a worker before its loop starts.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unit {unit} has no valid owning principal")]
    InvalidPrincipal { unit: UnitId },

    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Runs a worker to completion and returns its exit code.
pub async fn run_worker(args: WorkerArgs) -> i32 {
    match start(args).await {
        Ok(LoopExit::Terminated) => EXIT_TERMINATED,
        Ok(LoopExit::HostDied) => EXIT_HOST_DIED,
        Err(e) => {
            error!(error = %e, "Worker failed to start");
            EXIT_STARTUP_FAILED
        }
    }
}

async fn start(args: WorkerArgs) -> Result<LoopExit, WorkerError> {
    let WorkerArgs {
        entry,
        unit,
        extra,
        config,
    } = args;

    signals::unblock_signals()?;

    let latch = Arc::new(Latch::new()?);
    let reload = Arc::new(ReloadFlag::new());
    let bridge = Arc::new(SignalBridge::new(Arc::clone(&reload), Arc::clone(&latch)));
    let _handlers = bridge.install()?;

    let terminate = CancellationToken::new();
    spawn_terminate_listener(terminate.clone())?;
    let host_death = CancellationToken::new();
    match host_pipe() {
        Ok(pipe) => spawn_host_death_watch(pipe, host_death.clone()),
        Err(e) => warn!(error = %e, "stdin is not a pipe, host death will go unnoticed"),
    }

    let settings = DaemonConfig::load(config.as_deref())?;
    let ctx = WorkerContext::establish(unit, extra, settings.naptime())?;

    info!(
        entry = %entry,
        unit = %ctx.unit(),
        principal = %ctx.principal(),
        pid = ctx.pid(),
        "Maintenance worker started"
    );
    report_ready(&ctx, tokio::io::stdout()).await?;

    let main_loop = MaintenanceLoop::new(
        ctx,
        latch,
        reload,
        terminate,
        host_death,
        LogCycle::default(),
        FileConfigSource::new(config),
    );
    Ok(main_loop.run().await)
}

/// Writes the readiness line to the handshake channel.
pub async fn report_ready<W>(ctx: &WorkerContext, mut out: W) -> Result<(), WorkerError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = WorkerReport::ready(ctx.unit(), ctx.pid()).to_line()?;
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Cancels `token` when SIGTERM arrives.
fn spawn_terminate_listener(token: CancellationToken) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            debug!("Received SIGTERM");
        }
        token.cancel();
    });
    Ok(())
}

/// Opens stdin as a non-blocking pipe reader.
///
/// `tokio::io::stdin` reads on the blocking pool, and a read pending there
/// keeps the runtime from shutting down after the loop exits.
pub fn host_pipe() -> io::Result<pipe::Receiver> {
    let fd = io::stdin().as_fd().try_clone_to_owned()?;
    pipe::Receiver::from_file(File::from(fd))
}

/// Cancels `token` once `pipe` reaches EOF or fails.
pub fn spawn_host_death_watch<R>(mut pipe: R, token: CancellationToken)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        debug!("Host pipe closed");
        token.cancel();
    });
}
