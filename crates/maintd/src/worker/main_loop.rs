//! Maintenance worker main loop.
//!
//! ```text
//! ┌─▶ interrupt check ── terminated ──▶ LoopExit::Terminated
//! │        │
//! │   cycle hook
//! │        │
//! │   timed wait ─── host death ──────▶ LoopExit::HostDied
//! │   (latch | terminate | naptime)
//! │        │
//! │   reset latch if it fired
//! │        │
//! └── reload if requested
//! ```
//!
//! The loop only suspends in the timed wait, so it notices termination within
//! one naptime and reload requests as soon as the latch is set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DaemonConfig};

use super::context::WorkerContext;
use super::latch::Latch;
use super::signals::ReloadFlag;

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Terminated,
    HostDied,
}

/// Work run once per loop iteration.
#[async_trait]
pub trait CycleHook: Send {
    async fn on_cycle(&mut self, ctx: &WorkerContext);
}

/// Default hook: logs each cycle.
#[derive(Debug, Default)]
pub struct LogCycle {
    cycles: u64,
}

#[async_trait]
impl CycleHook for LogCycle {
    async fn on_cycle(&mut self, ctx: &WorkerContext) {
        self.cycles += 1;
        debug!(unit = %ctx.unit(), cycle = self.cycles, "Maintenance cycle");
    }
}

/// Settings a worker picks up on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub naptime: Duration,
}

/// Where a worker re-reads its settings from.
pub trait ConfigSource: Send + Sync {
    fn reload(&self) -> Result<WorkerSettings, ConfigError>;
}

/// Reads settings from the daemon config file.
#[derive(Debug, Clone, Default)]
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl ConfigSource for FileConfigSource {
    fn reload(&self) -> Result<WorkerSettings, ConfigError> {
        let config = DaemonConfig::load(self.path.as_deref())?;
        Ok(WorkerSettings {
            naptime: config.naptime(),
        })
    }
}

enum Woken {
    Latch,
    Terminate,
    Timeout,
}

/// The worker's event loop.
pub struct MaintenanceLoop<H, C> {
    ctx: WorkerContext,
    latch: Arc<Latch>,
    reload: Arc<ReloadFlag>,
    terminate: CancellationToken,
    host_death: CancellationToken,
    hook: H,
    config: C,
}

impl<H: CycleHook, C: ConfigSource> MaintenanceLoop<H, C> {
    pub fn new(
        ctx: WorkerContext,
        latch: Arc<Latch>,
        reload: Arc<ReloadFlag>,
        terminate: CancellationToken,
        host_death: CancellationToken,
        hook: H,
        config: C,
    ) -> Self {
        Self {
            ctx,
            latch,
            reload,
            terminate,
            host_death,
            hook,
            config,
        }
    }

    /// Runs until termination or host death.
    pub async fn run(mut self) -> LoopExit {
        info!(
            unit = %self.ctx.unit(),
            naptime_ms = self.ctx.naptime().as_millis() as u64,
            "Maintenance loop running"
        );

        loop {
            if self.terminate.is_cancelled() {
                info!(unit = %self.ctx.unit(), "Maintenance worker terminating");
                return LoopExit::Terminated;
            }

            self.hook.on_cycle(&self.ctx).await;

            let woken = tokio::select! {
                biased;
                _ = self.host_death.cancelled() => {
                    warn!(unit = %self.ctx.unit(), "Host died, exiting");
                    return LoopExit::HostDied;
                }
                _ = self.terminate.cancelled() => Woken::Terminate,
                res = self.latch.wait() => {
                    if let Err(e) = res {
                        warn!(error = %e, "Latch wait failed");
                        sleep(self.ctx.naptime()).await;
                    }
                    Woken::Latch
                }
                _ = sleep(self.ctx.naptime()) => Woken::Timeout,
            };

            match woken {
                Woken::Latch => self.latch.reset(),
                Woken::Terminate | Woken::Timeout => {}
            }

            if self.reload.take() {
                self.apply_reload();
            }
        }
    }

    fn apply_reload(&mut self) {
        match self.config.reload() {
            Ok(settings) => {
                self.ctx.set_naptime(settings.naptime);
                info!(
                    unit = %self.ctx.unit(),
                    naptime_ms = settings.naptime.as_millis() as u64,
                    "Configuration reloaded"
                );
            }
            Err(e) => {
                warn!(unit = %self.ctx.unit(), error = %e, "Configuration reload failed, keeping current settings");
            }
        }
    }
}
