//! Domain-specific error types following panic-free policy.

use crate::UnitId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The unit table has no free slot for another unit
    #[error("Unit table is full ({capacity} slots)")]
    TableFull { capacity: usize },

    /// Unit not present in the table
    #[error("Unit not found: {unit}")]
    UnitNotFound { unit: UnitId },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
