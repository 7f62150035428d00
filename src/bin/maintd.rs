//! maintd - Maintenance worker supervisor daemon
//!
//! This binary runs the host: it owns the unit registry, accepts caller
//! requests on a Unix socket and runs one maintenance worker process per
//! unit.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! maintd start
//!
//! # Start the daemon (background/daemonized)
//! maintd start -d
//!
//! # Use a specific config file
//! maintd start --config /etc/maintd.toml
//!
//! # Stop the daemon
//! maintd stop
//!
//! # Check daemon status
//! maintd status
//!
//! # Enable debug logging
//! RUST_LOG=maintd=debug maintd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (workers get SIGTERM)
//! - SIGHUP: Reload configuration and forward the reload to workers

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use maint_core::{UnitId, WorkerPayload};
use maintd::config::DaemonConfig;
use maintd::host::Host;
use maintd::monitor::spawn_monitor_task;
use maintd::procman::{EntryPoint, WorkerCommand};
use maintd::server::DaemonServer;
use maintd::worker::{run_worker, WorkerArgs, EXIT_STARTUP_FAILED};

/// maintd - per-unit maintenance worker supervisor
#[derive(Parser, Debug)]
#[command(name = "maintd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (default: <config_dir>/maintd/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a maintenance worker (spawned by the daemon)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        entry: String,

        #[arg(long)]
        unit: UnitId,

        /// Launch payload as 16 hex chars
        #[arg(long)]
        extra: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("maintd")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("maintd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("maintd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the daemon's PID if it is running, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'maintd stop' to stop it first.");
                process::exit(1);
            }

            // Validate before forking so config errors reach the terminal
            let settings = DaemonConfig::load(config.as_deref())
                .context("Failed to load configuration")?;

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(settings, config);
            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Workers get a grace period of their own
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let settings = DaemonConfig::load(config.as_deref()).unwrap_or_default();
                if settings.socket_path.exists() {
                    println!("Socket: {}", settings.socket_path.display());
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Worker {
            entry,
            unit,
            extra,
            config,
        } => {
            let code = run_worker_process(&entry, unit, &extra, config);
            process::exit(code);
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to open log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_logging(default_directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(default_directive.parse()?)
                .add_directive("maint_core=info".parse()?)
                .add_directive("maint_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_daemon(settings: DaemonConfig, config_path: Option<PathBuf>) -> Result<()> {
    init_logging("maintd=info")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "maintd starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let mut command = WorkerCommand::current_exe().context("Cannot locate maintd executable")?;
    if let Some(path) = &config_path {
        command = command.arg("--config").arg(path);
    }

    let host = Arc::new(
        Host::start(&settings, command, cancel_token.clone()).context("Host startup failed")?,
    );

    spawn_reload_listener(Arc::clone(&host), config_path, cancel_token.clone())?;
    let _monitor_handle = spawn_monitor_task(Arc::clone(host.supervisor()), cancel_token.clone());

    let server = DaemonServer::new(
        settings.socket_path.clone(),
        Arc::clone(host.supervisor()),
        cancel_token,
    );

    let result = server.run().await;
    host.shutdown().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("maintd stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}

/// Reloads configuration on SIGHUP and forwards the reload to workers.
fn spawn_reload_listener(
    host: Arc<Host>,
    config_path: Option<PathBuf>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match DaemonConfig::load(config_path.as_deref()) {
                        Ok(config) => {
                            let count = host.reload(config).await;
                            info!(workers = count, "Configuration reloaded");
                        }
                        Err(e) => warn!(error = %e, "Configuration reload failed, keeping current settings"),
                    }
                }
            }
        }
    });
    Ok(())
}

fn run_worker_process(entry: &str, unit: UnitId, extra: &str, config: Option<PathBuf>) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("maintd worker: failed to start runtime: {e}");
            return EXIT_STARTUP_FAILED;
        }
    };
    let code = runtime.block_on(worker_main(entry, unit, extra, config));
    // Exit as soon as the loop does; nothing left on the runtime is awaited
    runtime.shutdown_background();
    code
}

async fn worker_main(entry: &str, unit: UnitId, extra: &str, config: Option<PathBuf>) -> i32 {
    // stdout is the handshake channel; logs go to stderr
    if let Err(e) = init_logging("maintd=info") {
        eprintln!("maintd worker: bad log filter: {e}");
        return EXIT_STARTUP_FAILED;
    }

    let entry = match entry.parse::<EntryPoint>() {
        Ok(entry) => entry,
        Err(e) => {
            error!(error = %e, "Unknown worker entry point");
            return EXIT_STARTUP_FAILED;
        }
    };
    let extra = match WorkerPayload::from_hex(extra) {
        Ok(extra) => extra,
        Err(e) => {
            error!(error = %e, "Invalid worker payload");
            return EXIT_STARTUP_FAILED;
        }
    };

    run_worker(WorkerArgs {
        entry,
        unit,
        extra,
        config,
    })
    .await
}
