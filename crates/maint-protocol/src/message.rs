//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use maint_core::{UnitId, WorkerView};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Client identifier (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Make sure a maintenance worker runs for a unit
    EnsureWorker { unit: UnitId },

    /// Request the current worker table
    ListWorkers,

    /// Set the latch of a unit's worker so it runs a cycle now
    WakeWorker { unit: UnitId },

    /// Ask every worker to re-read its configuration
    ReloadWorkers,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn ensure_worker(unit: UnitId) -> Self {
        Self::new(MessageType::EnsureWorker { unit })
    }

    pub fn list_workers() -> Self {
        Self::new(MessageType::ListWorkers)
    }

    pub fn wake_worker(unit: UnitId) -> Self {
        Self::new(MessageType::WakeWorker { unit })
    }

    pub fn reload_workers() -> Self {
        Self::new(MessageType::ReloadWorkers)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// How an ensure request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// This request launched the worker
    Launched,
    /// A launch had already been requested earlier
    AlreadyStarted,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Reply to `ensure_worker`
    WorkerEnsured {
        unit: UnitId,
        outcome: EnsureOutcome,
        /// Pid of the freshly launched worker
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// Reply to `list_workers`
    WorkerList { workers: Vec<WorkerView> },

    /// Reply to `wake_worker` / `reload_workers`
    Signalled {
        /// Number of worker processes signalled
        count: usize,
    },

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn launched(unit: UnitId, pid: u32) -> Self {
        Self::WorkerEnsured {
            unit,
            outcome: EnsureOutcome::Launched,
            pid: Some(pid),
        }
    }

    pub fn already_started(unit: UnitId) -> Self {
        Self::WorkerEnsured {
            unit,
            outcome: EnsureOutcome::AlreadyStarted,
            pid: None,
        }
    }

    pub fn worker_list(workers: Vec<WorkerView>) -> Self {
        Self::WorkerList { workers }
    }

    pub fn signalled(count: usize) -> Self {
        Self::Signalled { count }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
