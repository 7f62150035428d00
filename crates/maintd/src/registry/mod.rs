//! Shared unit registry and its initialization lifecycle.
//!
//! The registry is the only state shared between callers of the supervisor.
//! It lives in the host's shared arena as a single [`ControlBlock`]: one lock
//! around a fixed-capacity [`UnitTable`].
//!
//! # Lifecycle
//!
//! ```text
//! pre-start                    startup                     any caller
//! ─────────                    ───────                     ──────────
//! request_shmem(setup, n) ──▶ hook chain runs ──────────▶ ControlBlock::attach
//!   reserve control_block_size   ControlBlock::attach        returns the same
//!   chain startup hook           (first touch builds it)     Arc every time
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`

use std::mem::size_of;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use maint_core::{UnitId, UnitTable, WorkerRecord};

use crate::shmem::{HostSetup, SharedArena, ShmemError};

/// Name of the control block inside the shared arena.
pub const CONTROL_BLOCK_NAME: &str = "maintenance daemon";

/// Shared registry: the lock and the unit table it protects.
#[derive(Debug)]
pub struct ControlBlock {
    table: Mutex<UnitTable>,
}

impl ControlBlock {
    /// Builds an empty control block with room for `slots` units.
    pub fn new(slots: usize) -> Self {
        Self {
            table: Mutex::new(UnitTable::with_capacity(slots)),
        }
    }

    /// Attaches to the host's control block, constructing it on first touch.
    ///
    /// Idempotent: every call after the first returns the same instance and
    /// ignores `slots`.
    pub fn attach(arena: &SharedArena, slots: usize) -> Result<Arc<Self>, ShmemError> {
        let (block, found) = arena.attach_or_init(
            CONTROL_BLOCK_NAME,
            control_block_size(slots),
            || Self::new(slots),
        )?;
        if !found {
            info!(slots, "Unit registry initialized");
        }
        Ok(block)
    }

    /// Acquires the registry lock.
    ///
    /// Critical sections must stay short: never hold the guard across a wait
    /// for another process's progress.
    pub async fn lock(&self) -> MutexGuard<'_, UnitTable> {
        self.table.lock().await
    }

    /// Copies the record for `unit`, if registered.
    pub async fn record(&self, unit: UnitId) -> Option<WorkerRecord> {
        self.lock().await.record(unit).ok().cloned()
    }

    /// Copies every record, ordered by unit.
    pub async fn records(&self) -> Vec<WorkerRecord> {
        self.lock().await.records().into_iter().cloned().collect()
    }

    pub async fn capacity(&self) -> usize {
        self.lock().await.capacity()
    }
}

/// Bytes reserved for a control block holding `slots` units.
///
/// Covers the block itself plus a table area sized like an open hash table
/// at full load: one key and one record per slot, doubled for bucket slack.
pub fn control_block_size(slots: usize) -> usize {
    let entry = size_of::<UnitId>() + size_of::<WorkerRecord>();
    size_of::<ControlBlock>().saturating_add(entry.saturating_mul(slots).saturating_mul(2))
}

/// Reserves registry space and chains its startup initializer.
///
/// Call once during host pre-start, before [`HostSetup::start`].
pub fn request_shmem(setup: &mut HostSetup, slots: usize) {
    setup.request_space(control_block_size(slots));
    setup.chain_startup_hook(move |arena| ControlBlock::attach(arena, slots).map(|_| ()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_grows_with_slots() {
        assert!(control_block_size(8) > control_block_size(1));
        assert!(control_block_size(0) >= size_of::<ControlBlock>());
    }

    #[tokio::test]
    async fn test_startup_builds_block_once() {
        let mut setup = HostSetup::new();
        request_shmem(&mut setup, 4);
        let arena = setup.start().unwrap();

        // The startup hook already built it; attaching finds it
        let (_, found) = arena
            .attach_or_init(CONTROL_BLOCK_NAME, control_block_size(4), || ControlBlock::new(99))
            .unwrap();
        assert!(found);

        let a = ControlBlock::attach(&arena, 4).unwrap();
        let b = ControlBlock::attach(&arena, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.capacity().await, 4);
    }

    #[tokio::test]
    async fn test_hook_chains_after_registry() {
        let mut setup = HostSetup::new();
        setup.chain_startup_hook(|arena| {
            // Runs after the registry hook below
            arena
                .segment_size(CONTROL_BLOCK_NAME)?
                .map(|_| ())
                .ok_or(ShmemError::Poisoned)
        });
        request_shmem(&mut setup, 2);

        assert!(setup.start().is_ok());
    }

    #[tokio::test]
    async fn test_records_snapshot() {
        let block = ControlBlock::new(3);
        {
            let mut table = block.lock().await;
            let (record, _) = table.enter(UnitId::new(2)).unwrap();
            record.mark_started();
            table.enter(UnitId::new(1)).unwrap();
        }

        let records = block.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].unit_id(), UnitId::new(1));
        assert!(records[1].is_started());
        assert!(block.record(UnitId::new(9)).await.is_none());
    }
}
