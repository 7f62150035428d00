//! maint-core - Shared types for the maintenance worker supervisor
//!
//! This crate provides the domain types shared between
//! the daemon (maintd), its workers and the control client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod record;
pub mod unit;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use record::{UnitTable, WorkerRecord, WorkerView};
pub use unit::{PrincipalId, UnitId, WorkerPayload, PAYLOAD_LEN};
