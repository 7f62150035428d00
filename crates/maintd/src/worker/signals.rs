//! Signal-to-flag bridge for worker processes.
//!
//! Reload (SIGHUP) and wake (SIGUSR1) are handled by `signal-hook` actions that
//! only store an atomic or write a byte to the latch's self-pipe. Everything
//! else happens later in the main loop, outside signal context.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGUSR1};
use signal_hook::low_level::{self, pipe};
use signal_hook::{flag, SigId};
use tracing::debug;

use super::latch::Latch;

/// Pending configuration-reload request.
#[derive(Debug, Default)]
pub struct ReloadFlag(Arc<AtomicBool>);

impl ReloadFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Converts reload and wake notifications into flag and latch updates.
#[derive(Debug)]
pub struct SignalBridge {
    reload: Arc<ReloadFlag>,
    latch: Arc<Latch>,
}

impl SignalBridge {
    pub fn new(reload: Arc<ReloadFlag>, latch: Arc<Latch>) -> Self {
        Self { reload, latch }
    }

    /// Reload notification from outside signal context.
    pub fn on_reload(&self) {
        self.reload.raise();
        self.latch.set();
    }

    /// Wake notification from outside signal context.
    pub fn on_wake(&self) {
        self.latch.set();
    }

    /// Installs the SIGHUP and SIGUSR1 handlers.
    ///
    /// The handlers stay installed until the returned guard is dropped. Actions
    /// for one signal run in registration order, so the reload flag is raised
    /// before the latch wakes the loop.
    pub fn install(&self) -> io::Result<SignalGuard> {
        let mut guard = SignalGuard { ids: Vec::new() };

        guard.ids.push(flag::register(SIGHUP, Arc::clone(&self.reload.0))?);
        guard.ids.push(pipe::register(SIGHUP, self.latch.signal_pipe()?)?);
        guard.ids.push(pipe::register(SIGUSR1, self.latch.signal_pipe()?)?);

        debug!("Reload and wake handlers installed");
        Ok(guard)
    }
}

/// Unregisters the bridge's handlers on drop.
#[derive(Debug)]
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
    }
}

/// Clears the calling thread's signal mask.
pub fn unblock_signals() -> io::Result<()> {
    // SAFETY: the set is initialized by sigemptyset before use
    let rc = unsafe {
        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::pthread_sigmask(libc::SIG_SETMASK, set.as_ptr(), std::ptr::null_mut())
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}
