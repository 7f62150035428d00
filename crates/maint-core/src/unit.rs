//! Type-safe identifiers for units and principals, and the opaque launch payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

// ============================================================================
// Unit Identifier
// ============================================================================

/// Identifier of a served unit (one database on the host).
///
/// Opaque to the supervisor: it is only ever compared, hashed and displayed.
/// The numeric form mirrors how the host identifies its databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u32);

impl UnitId {
    /// Creates a unit id from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UnitId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|e| DomainError::ParseError {
                field: "unit id".to_string(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// Principal Identifier
// ============================================================================

/// Identifier of the principal a worker acts as (the owner of its unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(u32);

impl PrincipalId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PrincipalId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|e| DomainError::ParseError {
                field: "principal id".to_string(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// Worker Payload
// ============================================================================

/// Size of the opaque payload handed to a launched worker.
pub const PAYLOAD_LEN: usize = 8;

/// Opaque bytes carried from the launch request into the worker process.
///
/// The process manager never interprets it. The supervisor stores the acting
/// principal in the first four bytes (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerPayload([u8; PAYLOAD_LEN]);

impl WorkerPayload {
    pub const fn from_bytes(bytes: [u8; PAYLOAD_LEN]) -> Self {
        Self(bytes)
    }

    /// Packs a principal into a fresh payload.
    pub fn from_principal(principal: PrincipalId) -> Self {
        let mut bytes = [0u8; PAYLOAD_LEN];
        for (dst, src) in bytes.iter_mut().zip(principal.get().to_le_bytes()) {
            *dst = src;
        }
        Self(bytes)
    }

    /// Reads back the principal stored by [`WorkerPayload::from_principal`].
    pub fn principal(&self) -> PrincipalId {
        let mut raw = [0u8; 4];
        for (dst, src) in raw.iter_mut().zip(self.0.iter()) {
            *dst = *src;
        }
        PrincipalId::new(u32::from_le_bytes(raw))
    }

    pub fn as_bytes(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    /// Lowercase hex form used on worker command lines.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses the form produced by [`WorkerPayload::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self, DomainError> {
        let invalid = |reason: &str| DomainError::ParseError {
            field: "worker payload".to_string(),
            reason: reason.to_string(),
        };

        if s.len() != PAYLOAD_LEN * 2 || !s.is_ascii() {
            return Err(invalid("expected 16 hex characters"));
        }

        let mut bytes = [0u8; PAYLOAD_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = s.get(i * 2..i * 2 + 2).ok_or_else(|| invalid("truncated"))?;
            *byte = u8::from_str_radix(pair, 16).map_err(|e| invalid(&e.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for WorkerPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
