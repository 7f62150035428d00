//! Host shared-memory arena and startup hook chain.
//!
//! Subsystems reserve space before the host starts ([`HostSetup::request_space`])
//! and register a startup initializer ([`HostSetup::chain_startup_hook`]).
//! Initializers compose: registering one keeps the previously registered one
//! and runs it afterwards. [`HostSetup::start`] sizes the arena to the total
//! requested space and runs the chain once.
//!
//! Named structures live in the arena for the lifetime of the host. The first
//! caller of [`SharedArena::attach_or_init`] for a name constructs it; every
//! later caller attaches to the same instance.
//!
//! # Panic-Free Guarantees
//!
//! Lock poisoning is mapped to `ShmemError::Poisoned`; nothing here unwraps.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

/// Startup initializer run once the arena exists.
pub type StartupHook = Box<dyn FnOnce(&SharedArena) -> Result<(), ShmemError> + Send>;

// ============================================================================
// Host Setup (pre-start)
// ============================================================================

/// Pre-start registration of shared-memory requests and startup hooks.
#[derive(Default)]
pub struct HostSetup {
    requested: usize,
    startup_hook: Option<StartupHook>,
}

impl HostSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `size` bytes of shared space.
    pub fn request_space(&mut self, size: usize) {
        self.requested = self.requested.saturating_add(size);
        debug!(size, total = self.requested, "Shared space requested");
    }

    /// Total bytes requested so far.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Registers `hook` ahead of any previously registered startup hook.
    ///
    /// At startup `hook` runs first, then the hook it displaced. A failing
    /// hook stops the chain.
    pub fn chain_startup_hook<F>(&mut self, hook: F)
    where
        F: FnOnce(&SharedArena) -> Result<(), ShmemError> + Send + 'static,
    {
        let prev = self.startup_hook.take();
        self.startup_hook = Some(Box::new(move |arena: &SharedArena| {
            hook(arena)?;
            match prev {
                Some(prev) => prev(arena),
                None => Ok(()),
            }
        }));
    }

    /// Creates the arena and runs the startup hook chain.
    ///
    /// # Errors
    ///
    /// Any error returned by a startup hook; the host must not start.
    pub fn start(self) -> Result<Arc<SharedArena>, ShmemError> {
        let arena = Arc::new(SharedArena::with_budget(self.requested));
        info!(budget = self.requested, "Shared arena created");

        if let Some(hook) = self.startup_hook {
            hook(&arena)?;
        }
        Ok(arena)
    }
}

// ============================================================================
// Shared Arena
// ============================================================================

struct Segment {
    size: usize,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct ArenaState {
    used: usize,
    segments: HashMap<String, Segment>,
}

/// Fixed-budget store of named, host-lifetime structures.
pub struct SharedArena {
    budget: usize,
    state: Mutex<ArenaState>,
}

impl SharedArena {
    /// Creates an arena that can hold `budget` bytes worth of structures.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            state: Mutex::new(ArenaState::default()),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes accounted to existing structures.
    pub fn used(&self) -> Result<usize, ShmemError> {
        Ok(self.state.lock().map_err(|_| ShmemError::Poisoned)?.used)
    }

    /// Attaches to the structure called `name`, constructing it with `init` if
    /// this is the first touch.
    ///
    /// Returns the structure and whether it was already present. Only the
    /// first caller runs `init`; concurrent callers serialize on the arena's
    /// own lock, so `init` runs at most once per name.
    ///
    /// # Errors
    ///
    /// - `ShmemError::OutOfSharedMemory` if `size` does not fit the budget
    /// - `ShmemError::TypeMismatch` if `name` holds a different type
    pub fn attach_or_init<T, F>(
        &self,
        name: &str,
        size: usize,
        init: F,
    ) -> Result<(Arc<T>, bool), ShmemError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut state = self.state.lock().map_err(|_| ShmemError::Poisoned)?;

        if let Some(segment) = state.segments.get(name) {
            let value = Arc::clone(&segment.value)
                .downcast::<T>()
                .map_err(|_| ShmemError::TypeMismatch {
                    name: name.to_string(),
                })?;
            return Ok((value, true));
        }

        let available = self.budget.saturating_sub(state.used);
        if size > available {
            return Err(ShmemError::OutOfSharedMemory {
                name: name.to_string(),
                requested: size,
                available,
            });
        }

        let value = Arc::new(init());
        state.used += size;
        state.segments.insert(
            name.to_string(),
            Segment {
                size,
                value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            },
        );
        debug!(name, size, "Shared structure initialized");

        Ok((value, false))
    }

    /// Size accounted to `name`, if it exists.
    pub fn segment_size(&self, name: &str) -> Result<Option<usize>, ShmemError> {
        let state = self.state.lock().map_err(|_| ShmemError::Poisoned)?;
        Ok(state.segments.get(name).map(|s| s.size))
    }
}

/// Errors raised by the shared arena.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShmemError {
    #[error("out of shared memory for \"{name}\": requested {requested} bytes, {available} available")]
    OutOfSharedMemory {
        name: String,
        requested: usize,
        available: usize,
    },

    #[error("shared structure \"{name}\" exists with a different type")]
    TypeMismatch { name: String },

    #[error("shared arena lock poisoned")]
    Poisoned,
}
