//! Worker records and the fixed-capacity unit table that holds them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::UnitId;

// ============================================================================
// Worker Record
// ============================================================================

/// Supervisor state for one unit.
///
/// `started` only ever goes from false to true. It records that a launch was
/// requested, not that the worker is alive: liveness belongs to the process
/// manager's restart policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    unit_id: UnitId,
    started: bool,
    launch_requests: u32,
    requested_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// Creates a record for a unit that has not been launched yet.
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            started: false,
            launch_requests: 0,
            requested_at: None,
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of launch requests submitted for this unit.
    pub fn launch_requests(&self) -> u32 {
        self.launch_requests
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }

    /// Records a successfully submitted launch request.
    pub fn mark_started(&mut self) {
        self.started = true;
        self.launch_requests = self.launch_requests.saturating_add(1);
        self.requested_at = Some(Utc::now());
    }

    /// Builds a serializable view of this record.
    pub fn view(&self) -> WorkerView {
        WorkerView {
            unit: self.unit_id,
            started: self.started,
            launch_requests: self.launch_requests,
            requested_at: self.requested_at,
            pid: None,
            memory_mb: None,
            cpu_percent: None,
        }
    }
}

/// Read-only snapshot of a worker for status listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub unit: UnitId,
    pub started: bool,
    pub launch_requests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    /// Pid of the running worker, when the process manager knows one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
}

// ============================================================================
// Unit Table
// ============================================================================

/// Fixed-capacity map from unit id to worker record.
///
/// The capacity is set once at construction and never grows; inserting a new
/// unit into a full table fails instead of evicting anything.
#[derive(Debug)]
pub struct UnitTable {
    capacity: usize,
    records: HashMap<UnitId, WorkerRecord>,
}

impl UnitTable {
    /// Creates an empty table with room for `capacity` units.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up `unit`, inserting a fresh record if absent.
    ///
    /// Returns the record and whether it already existed.
    ///
    /// # Errors
    ///
    /// `DomainError::TableFull` if `unit` is absent and every slot is taken.
    /// Existing units are always found, even in a full table.
    pub fn enter(&mut self, unit: UnitId) -> DomainResult<(&mut WorkerRecord, bool)> {
        let found = self.records.contains_key(&unit);
        if !found && self.records.len() >= self.capacity {
            return Err(DomainError::TableFull {
                capacity: self.capacity,
            });
        }

        let record = self
            .records
            .entry(unit)
            .or_insert_with(|| WorkerRecord::new(unit));
        Ok((record, found))
    }

    /// Returns the record for `unit`.
    pub fn record(&self, unit: UnitId) -> DomainResult<&WorkerRecord> {
        self.records
            .get(&unit)
            .ok_or(DomainError::UnitNotFound { unit })
    }

    /// Iterates records in unit order.
    pub fn records(&self) -> Vec<&WorkerRecord> {
        let mut records: Vec<&WorkerRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.unit_id());
        records
    }
}
