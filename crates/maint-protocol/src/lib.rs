//! maint-protocol - Wire protocol for daemon communication
//!
//! This crate provides message types for communication between
//! `maintctl` callers and the daemon, and the one-line startup
//! handshake a worker process sends back to the process manager.

pub mod handshake;
pub mod message;
pub mod version;

pub use handshake::{HandshakeError, WorkerReport};
pub use message::{ClientMessage, DaemonMessage, EnsureOutcome, MessageType};
pub use version::{ProtocolVersion, VersionError};
