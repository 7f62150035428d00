//! Working context a maintenance worker runs in.

use std::time::Duration;

use maint_core::{PrincipalId, UnitId, WorkerPayload};

use super::WorkerError;

/// Unit, acting principal and timing of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    unit: UnitId,
    principal: PrincipalId,
    naptime: Duration,
    pid: u32,
}

impl WorkerContext {
    /// Connects the worker to `unit` as the principal carried in `payload`.
    pub fn establish(
        unit: UnitId,
        payload: WorkerPayload,
        naptime: Duration,
    ) -> Result<Self, WorkerError> {
        let principal = payload.principal();
        if principal.get() == 0 {
            return Err(WorkerError::InvalidPrincipal { unit });
        }
        Ok(Self {
            unit,
            principal,
            naptime,
            pid: std::process::id(),
        })
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn principal(&self) -> PrincipalId {
        self.principal
    }

    /// Timeout of the wait between cycles.
    pub fn naptime(&self) -> Duration {
        self.naptime
    }

    pub fn set_naptime(&mut self, naptime: Duration) {
        self.naptime = naptime;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}
