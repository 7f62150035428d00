//! maintctl - command-line caller of the maintd daemon
//!
//! # Usage
//!
//! ```text
//! maintctl ensure 16384     # make sure unit 16384 has a maintenance worker
//! maintctl list             # show the worker table
//! maintctl wake 16384       # run a maintenance cycle now
//! maintctl reload           # ask every worker to reload its config
//! maintctl ping
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maint_core::UnitId;
use maint_protocol::EnsureOutcome;
use maintd::client::ControlClient;
use maintd::config::DaemonConfig;

/// Talk to a running maintd
#[derive(Parser, Debug)]
#[command(name = "maintctl", version, about)]
struct Args {
    /// Daemon socket (default: from config, MAINT_SOCKET, or /tmp/maintd.sock)
    #[arg(long, short = 's', global = true)]
    socket: Option<PathBuf>,

    /// Config file used to locate the socket
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make sure a unit has its maintenance worker
    Ensure { unit: UnitId },
    /// List workers
    List,
    /// Wake a unit's worker
    Wake { unit: UnitId },
    /// Ask every worker to reload its configuration
    Reload,
    /// Check the daemon is answering
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("maintd=warn".parse()?))
        .init();

    let args = Args::parse();

    let socket = match args.socket {
        Some(socket) => socket,
        None => {
            DaemonConfig::load(args.config.as_deref())
                .context("Failed to load configuration")?
                .socket_path
        }
    };

    let mut client = ControlClient::connect(&socket).await?;

    match args.command {
        Command::Ensure { unit } => match client.ensure_worker(unit).await {
            Ok(reply) => match (reply.outcome, reply.pid) {
                (EnsureOutcome::Launched, Some(pid)) => {
                    println!("unit {}: launched worker (pid {pid})", reply.unit)
                }
                (EnsureOutcome::Launched, None) => println!("unit {}: launched worker", reply.unit),
                (EnsureOutcome::AlreadyStarted, _) => {
                    println!("unit {}: worker already started", reply.unit)
                }
            },
            Err(e) => {
                eprintln!("unit {unit}: {e}");
                if let Some(code) = e.code() {
                    eprintln!("code: {code}");
                }
                process::exit(1);
            }
        },
        Command::List => {
            let workers = client.list_workers().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&workers)?);
            } else {
                println!(
                    "{:<10} {:<8} {:<9} {:<8} {:>8} {:>6}",
                    "UNIT", "STARTED", "LAUNCHES", "PID", "MEM(MB)", "CPU%"
                );
                for w in workers {
                    println!(
                        "{:<10} {:<8} {:<9} {:<8} {:>8} {:>6}",
                        w.unit,
                        w.started,
                        w.launch_requests,
                        w.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                        w.memory_mb.map_or_else(|| "-".to_string(), |m| m.to_string()),
                        w.cpu_percent.map_or_else(|| "-".to_string(), |c| format!("{c:.1}")),
                    );
                }
            }
        }
        Command::Wake { unit } => {
            let count = client.wake_worker(unit).await?;
            println!("unit {unit}: signalled {count} worker(s)");
        }
        Command::Reload => {
            let count = client.reload_workers().await?;
            println!("signalled {count} worker(s)");
        }
        Command::Ping => {
            client.ping(1).await?;
            println!("pong");
        }
    }

    client.disconnect().await?;
    Ok(())
}
