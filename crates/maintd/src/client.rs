//! Control client for talking to a running daemon.
//!
//! One `ControlClient` is one caller: it connects, performs the protocol
//! handshake, then issues request/reply exchanges.
//!
//! ```rust,ignore
//! use maintd::client::ControlClient;
//! use maint_core::UnitId;
//!
//! let mut client = ControlClient::connect("/tmp/maintd.sock").await?;
//! let reply = client.ensure_worker(UnitId::new(16384)).await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use maint_core::{UnitId, WorkerView};
use maint_protocol::{ClientMessage, DaemonMessage, EnsureOutcome, ProtocolVersion};

/// Default bound on a single reply. Ensure requests wait for worker startup,
/// so this sits above the daemon's startup timeout.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Reply to an ensure request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureReply {
    pub unit: UnitId,
    pub outcome: EnsureOutcome,
    pub pid: Option<u32>,
}

/// Connected caller of the daemon's control socket.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    reply_timeout: Duration,
}

impl ControlClient {
    /// Connects to `socket_path` and performs the handshake.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::connect_as(socket_path, None).await
    }

    /// Connects with an explicit client id.
    pub async fn connect_as(
        socket_path: impl AsRef<Path>,
        client_id: Option<String>,
    ) -> Result<Self, ClientError> {
        let path = socket_path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| ClientError::Connect {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        };

        match client.request(ClientMessage::connect(client_id)).await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client: ProtocolVersion::CURRENT,
                        daemon: protocol_version,
                    });
                }
                debug!(client_id = %client_id, "Handshake complete");
                client.client_id = client_id;
                Ok(client)
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(ClientError::VersionMismatch {
                client: ProtocolVersion::CURRENT,
                daemon: protocol_version,
            }),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn ensure_worker(&mut self, unit: UnitId) -> Result<EnsureReply, ClientError> {
        match self.request(ClientMessage::ensure_worker(unit)).await? {
            DaemonMessage::WorkerEnsured { unit, outcome, pid } => {
                Ok(EnsureReply { unit, outcome, pid })
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_workers(&mut self) -> Result<Vec<WorkerView>, ClientError> {
        match self.request(ClientMessage::list_workers()).await? {
            DaemonMessage::WorkerList { workers } => Ok(workers),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the number of worker processes signalled.
    pub async fn wake_worker(&mut self, unit: UnitId) -> Result<usize, ClientError> {
        match self.request(ClientMessage::wake_worker(unit)).await? {
            DaemonMessage::Signalled { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reload_workers(&mut self) -> Result<usize, ClientError> {
        match self.request(ClientMessage::reload_workers()).await? {
            DaemonMessage::Signalled { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<(), ClientError> {
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Says goodbye and closes the connection.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::disconnect()).await
    }

    async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage, ClientError> {
        self.send(&message).await?;
        let reply = timeout(self.reply_timeout, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)??;

        match reply {
            DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
            reply => Ok(reply),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonMessage, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn unexpected(msg: DaemonMessage) -> ClientError {
    ClientError::Unexpected(format!("{msg:?}"))
}

/// Errors returned by the control client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to daemon at {path}: {error} (is maintd running?)")]
    Connect { path: PathBuf, error: String },

    #[error("protocol version mismatch: client {client}, daemon {daemon}")]
    VersionMismatch {
        client: ProtocolVersion,
        daemon: ProtocolVersion,
    },

    #[error("daemon error: {message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("unexpected reply: {0}")]
    Unexpected(String),

    #[error("daemon closed the connection")]
    Closed,

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Error code sent by the daemon, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Daemon { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_hints_at_daemon() {
        let err = ClientError::Connect {
            path: PathBuf::from("/tmp/none.sock"),
            error: "No such file".to_string(),
        };
        assert!(err.to_string().contains("maintd running"));
    }

    #[test]
    fn test_daemon_error_code() {
        let err = ClientError::Daemon {
            message: "full".to_string(),
            code: Some("slot_exhaustion".to_string()),
        };
        assert_eq!(err.code(), Some("slot_exhaustion"));
        assert_eq!(ClientError::Closed.code(), None);
    }
}
