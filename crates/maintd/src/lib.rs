//! maintd - per-unit singleton maintenance worker supervisor
//!
//! This crate provides the daemon side of the maintenance system:
//! - `registry` - Shared unit registry (`ControlBlock`) and its init lifecycle
//! - `supervisor` - `ensure_worker_running`, the race-free start entry point
//! - `procman` - Process manager interface and the child-process manager
//! - `worker` - The maintenance worker's main loop and signal bridge
//! - `server` / `client` - Unix socket control protocol
//! - `monitor` - Worker resource sampling
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          maintd host                           │
//! │                                                                │
//! │  ┌────────────────┐    ┌──────────────┐    ┌────────────────┐  │
//! │  │  DaemonServer  │───▶│  Supervisor  │───▶│ ProcessManager │  │
//! │  │ (Unix socket)  │    │              │    │ (child procs)  │  │
//! │  └───────┬────────┘    └──────┬───────┘    └───────┬────────┘  │
//! │          │ callers            │ lock               │ spawn     │
//! │          ▼                    ▼                    ▼           │
//! │  ┌────────────────┐    ┌──────────────┐    ┌────────────────┐  │
//! │  │ConnectionHandler│   │ ControlBlock │    │ maintd worker  │  │
//! │  │  (per caller)  │    │ (SharedArena)│    │ (one per unit) │  │
//! │  └────────────────┘    └──────────────┘    └────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod client;
pub mod config;
pub mod host;
pub mod monitor;
pub mod owner;
pub mod procman;
pub mod registry;
pub mod server;
pub mod shmem;
pub mod supervisor;
pub mod worker;
