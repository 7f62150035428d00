//! Startup handshake between a worker process and the process manager.
//!
//! A freshly spawned worker writes exactly one [`WorkerReport`] line to its
//! stdout once its signal handlers and working context are in place. The
//! process manager treats that line as startup confirmation.

use maint_core::UnitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Report written by a worker on its handshake channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    /// Worker finished initializing and entered its main loop
    Ready { unit: UnitId, pid: u32 },
}

impl WorkerReport {
    pub fn ready(unit: UnitId, pid: u32) -> Self {
        Self::Ready { unit, pid }
    }

    /// Serializes the report as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, HandshakeError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one handshake line (trailing newline allowed).
    pub fn parse_line(line: &str) -> Result<Self, HandshakeError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(HandshakeError::Empty);
        }
        serde_json::from_str(trimmed).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}

/// Errors that can occur while reading a handshake line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("empty handshake line")]
    Empty,

    #[error("malformed handshake line: {0}")]
    Malformed(String),
}
