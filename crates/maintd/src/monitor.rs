//! Resource monitoring for maintenance workers.
//!
//! Samples CPU and memory usage of running worker processes, providing:
//! - Per-worker figures for `list_workers` replies
//! - Periodic logging of worker resource usage
//! - Warnings when a worker exceeds its thresholds
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Processes that vanish between listing and sampling are skipped

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maint_core::WorkerView;

use crate::supervisor::Supervisor;

/// Memory usage warning threshold in MB.
pub const HIGH_MEMORY_THRESHOLD_MB: u64 = 256;

/// CPU usage warning threshold (percentage).
pub const HIGH_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// How often to sample workers.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Resource usage of one worker process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSample {
    pub pid: u32,

    /// Memory usage in bytes
    pub memory_bytes: u64,

    /// Memory usage in megabytes (convenience)
    pub memory_mb: u64,

    /// CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,

    pub memory_high: bool,

    pub cpu_high: bool,
}

impl ResourceSample {
    /// Returns true if any metric is above its threshold.
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples worker processes with `sysinfo`.
///
/// CPU figures need a previous refresh as baseline, so the first sample of a
/// process reports 0%.
pub struct ResourceProbe {
    system: System,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ResourceProbe {
    pub fn new() -> Self {
        Self::with_thresholds(HIGH_MEMORY_THRESHOLD_MB, HIGH_CPU_THRESHOLD_PERCENT)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and samples `pids`.
    ///
    /// Pids that no longer exist are missing from the result.
    pub fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ResourceSample> {
        if pids.is_empty() {
            return HashMap::new();
        }
        // refresh_all() is required for CPU calculation to work
        self.system.refresh_all();

        pids.iter()
            .filter_map(|&pid| {
                self.system.process(Pid::from_u32(pid)).map(|p| {
                    let memory_bytes = p.memory();
                    let memory_mb = memory_bytes / 1024 / 1024;
                    let cpu_percent = p.cpu_usage();
                    (
                        pid,
                        ResourceSample {
                            pid,
                            memory_bytes,
                            memory_mb,
                            cpu_percent,
                            memory_high: memory_mb > self.memory_threshold_mb,
                            cpu_high: cpu_percent > self.cpu_threshold_percent,
                        },
                    )
                })
            })
            .collect()
    }

    /// Fills in memory and CPU figures for views with a pid.
    pub fn annotate(&mut self, views: &mut [WorkerView]) {
        let pids: Vec<u32> = views.iter().filter_map(|v| v.pid).collect();
        let samples = self.sample(&pids);
        for view in views.iter_mut() {
            if let Some(sample) = view.pid.and_then(|pid| samples.get(&pid)) {
                view.memory_mb = Some(sample.memory_mb);
                view.cpu_percent = Some(sample.cpu_percent);
            }
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the periodic worker monitoring task.
pub fn spawn_monitor_task(
    supervisor: Arc<Supervisor>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = ResourceProbe::new();
        let mut tick = interval(METRICS_INTERVAL);

        info!(
            memory_threshold_mb = probe.memory_threshold_mb(),
            cpu_threshold_percent = probe.cpu_threshold_percent(),
            interval_secs = METRICS_INTERVAL.as_secs(),
            "Worker monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Worker monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let mut views = supervisor.list_workers().await;
                    probe.annotate(&mut views);
                    log_usage(&views, &probe);
                }
            }
        }

        debug!("Worker monitor task completed");
    })
}

fn log_usage(views: &[WorkerView], probe: &ResourceProbe) {
    for view in views {
        let (Some(pid), Some(memory_mb), Some(cpu)) = (view.pid, view.memory_mb, view.cpu_percent)
        else {
            continue;
        };
        if memory_mb > probe.memory_threshold_mb() {
            warn!(
                unit = %view.unit,
                pid,
                memory_mb,
                threshold_mb = probe.memory_threshold_mb(),
                "HIGH MEMORY: worker memory usage above threshold"
            );
        } else if cpu > probe.cpu_threshold_percent() {
            warn!(
                unit = %view.unit,
                pid,
                cpu_percent = format!("{cpu:.1}"),
                threshold_percent = probe.cpu_threshold_percent(),
                "HIGH CPU: worker CPU usage above threshold"
            );
        } else {
            debug!(
                unit = %view.unit,
                pid,
                memory_mb,
                cpu_percent = format!("{cpu:.1}"),
                "Worker resource usage"
            );
        }
    }
}
