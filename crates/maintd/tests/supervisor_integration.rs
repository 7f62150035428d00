//! Integration tests for the singleton worker supervisor.
//!
//! A scripted process manager stands in for the host so the tests can count
//! launch requests and control startup confirmation.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use maint_core::{PrincipalId, UnitId};
use maintd::config::DaemonConfig;
use maintd::owner::{ConfigOwners, FixedOwner, OwnerResolver};
use maintd::procman::{
    LaunchError, ProcessManager, WorkerHandle, WorkerSignal, WorkerSpec, WorkerState, WorkerStatus,
};
use maintd::registry::ControlBlock;
use maintd::supervisor::{Ensured, Supervisor, SupervisorError};

// ============================================================================
// Test Helpers
// ============================================================================

/// How the scripted manager answers startup waits.
#[derive(Clone, Copy)]
enum Startup {
    /// Worker is running as soon as it is registered
    Immediate,
    /// Worker never confirms
    Never,
}

struct Registered {
    spec: WorkerSpec,
    state: watch::Sender<WorkerState>,
}

struct ScriptedManager {
    startup: Startup,
    /// Delay inside register_worker, to widen race windows
    register_delay: Duration,
    fail_next: AtomicBool,
    registrations: AtomicUsize,
    registered: Mutex<Vec<Registered>>,
}

impl ScriptedManager {
    fn new(startup: Startup) -> Self {
        Self {
            startup,
            register_delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
            registrations: AtomicUsize::new(0),
            registered: Mutex::new(Vec::new()),
        }
    }

    fn with_register_delay(mut self, delay: Duration) -> Self {
        self.register_delay = delay;
        self
    }

    fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    fn specs(&self) -> Vec<WorkerSpec> {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.spec.clone())
            .collect()
    }
}

#[async_trait]
impl ProcessManager for ScriptedManager {
    async fn register_worker(&self, spec: WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        if !self.register_delay.is_zero() {
            sleep(self.register_delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::NoFreeSlot { max: 0 });
        }
        let slot = self.registrations.fetch_add(1, Ordering::SeqCst);

        let initial = match self.startup {
            Startup::Immediate => WorkerState::Running {
                pid: 1000 + slot as u32,
            },
            Startup::Never => WorkerState::Pending,
        };
        let (tx, rx) = watch::channel(initial);
        let unit = spec.main_arg;
        self.registered
            .lock()
            .unwrap()
            .push(Registered { spec, state: tx });

        Ok(WorkerHandle::new(slot, unit, rx))
    }

    async fn snapshot(&self) -> Vec<WorkerStatus> {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(slot, r)| WorkerStatus {
                slot,
                unit: r.spec.main_arg,
                name: r.spec.name.clone(),
                state: r.state.borrow().clone(),
                restarts: 0,
            })
            .collect()
    }

    async fn signal_workers(&self, unit: Option<UnitId>, _signal: WorkerSignal) -> usize {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .filter(|r| unit.map_or(true, |u| u == r.spec.main_arg))
            .filter(|r| r.state.borrow().pid().is_some())
            .count()
    }
}

fn owner() -> Arc<dyn OwnerResolver> {
    Arc::new(FixedOwner(PrincipalId::new(10)))
}

fn supervisor(
    slots: usize,
    procman: Arc<ScriptedManager>,
    startup_timeout: Duration,
) -> (Arc<Supervisor>, Arc<ControlBlock>) {
    let control = Arc::new(ControlBlock::new(slots));
    let supervisor = Supervisor::new(
        Arc::clone(&control),
        procman,
        owner(),
        Duration::from_secs(5),
        startup_timeout,
    );
    (Arc::new(supervisor), control)
}

const A: UnitId = UnitId::new(16384);
const B: UnitId = UnitId::new(16385);
const C: UnitId = UnitId::new(16386);

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_ensure_launches_once_then_fast_path() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let (supervisor, control) = supervisor(4, Arc::clone(&procman), Duration::from_secs(1));

    let first = supervisor.ensure_worker_running(A).await.unwrap();
    assert_eq!(first, Ensured::Launched { pid: 1000 });

    for _ in 0..5 {
        assert_eq!(
            supervisor.ensure_worker_running(A).await.unwrap(),
            Ensured::AlreadyStarted
        );
    }

    assert_eq!(procman.registrations(), 1);
    let record = control.record(A).await.expect("record exists");
    assert!(record.is_started());
    assert_eq!(record.launch_requests(), 1);
    assert!(record.requested_at().is_some());
}

#[tokio::test]
async fn test_launch_spec_carries_unit_and_owner() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let (supervisor, _) = supervisor(4, Arc::clone(&procman), Duration::from_secs(1));

    supervisor.ensure_worker_running(B).await.unwrap();

    let specs = procman.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].main_arg, B);
    assert_eq!(specs[0].name, "maintenance daemon: unit 16385");
    assert_eq!(specs[0].extra.principal(), PrincipalId::new(10));
    assert_eq!(specs[0].notify_pid, Some(std::process::id()));
}

// ============================================================================
// Race Freedom
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_launch_exactly_once() {
    const CALLERS: usize = 16;

    let procman = Arc::new(
        ScriptedManager::new(Startup::Immediate).with_register_delay(Duration::from_millis(20)),
    );
    let (supervisor, _) = supervisor(4, Arc::clone(&procman), Duration::from_secs(1));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.ensure_worker_running(A).await })
        })
        .collect();

    let mut launched = 0;
    let mut already = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Ensured::Launched { .. } => launched += 1,
            Ensured::AlreadyStarted => already += 1,
        }
    }

    assert_eq!(launched, 1);
    assert_eq!(already, CALLERS - 1);
    assert_eq!(procman.registrations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_distinct_units() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let (supervisor, control) = supervisor(8, Arc::clone(&procman), Duration::from_secs(1));

    let tasks: Vec<_> = (0..8u32)
        .flat_map(|i| {
            let unit = UnitId::new(100 + i);
            (0..3).map({
                let supervisor = Arc::clone(&supervisor);
                move |_| {
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move { supervisor.ensure_worker_running(unit).await })
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(procman.registrations(), 8);
    assert_eq!(control.records().await.len(), 8);
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn test_capacity_boundary_scenario() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let (supervisor, control) = supervisor(2, Arc::clone(&procman), Duration::from_secs(1));

    assert!(matches!(
        supervisor.ensure_worker_running(A).await,
        Ok(Ensured::Launched { .. })
    ));
    assert!(matches!(
        supervisor.ensure_worker_running(B).await,
        Ok(Ensured::Launched { .. })
    ));

    let err = supervisor.ensure_worker_running(C).await.unwrap_err();
    assert_eq!(err, SupervisorError::SlotExhaustion { max: 2 });
    assert!(err.to_string().contains("max_worker_slots"));

    assert_eq!(
        supervisor.ensure_worker_running(A).await.unwrap(),
        Ensured::AlreadyStarted
    );

    assert_eq!(procman.registrations(), 2);
    assert!(control.record(C).await.is_none());
}

// ============================================================================
// Failure Paths
// ============================================================================

#[tokio::test]
async fn test_launch_failure_leaves_unit_retryable() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    procman.fail_next.store(true, Ordering::SeqCst);
    let (supervisor, control) = supervisor(2, Arc::clone(&procman), Duration::from_secs(1));

    let err = supervisor.ensure_worker_running(A).await.unwrap_err();
    assert!(matches!(err, SupervisorError::LaunchRequestFailed { .. }));
    assert_eq!(err.code(), "launch_request_failed");

    let record = control.record(A).await.expect("record inserted");
    assert!(!record.is_started());

    assert!(matches!(
        supervisor.ensure_worker_running(A).await,
        Ok(Ensured::Launched { .. })
    ));
    assert_eq!(procman.registrations(), 1);
}

#[tokio::test]
async fn test_startup_timeout_keeps_started() {
    let procman = Arc::new(ScriptedManager::new(Startup::Never));
    let (supervisor, control) = supervisor(2, Arc::clone(&procman), Duration::from_millis(50));

    let err = supervisor.ensure_worker_running(A).await.unwrap_err();
    assert!(matches!(err, SupervisorError::StartupFailed { .. }));

    assert!(control.record(A).await.unwrap().is_started());
    assert_eq!(
        supervisor.ensure_worker_running(A).await.unwrap(),
        Ensured::AlreadyStarted
    );
    assert_eq!(procman.registrations(), 1);
}

#[tokio::test]
async fn test_unresolved_owner_launches_nothing() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let control = Arc::new(ControlBlock::new(2));
    let supervisor = Supervisor::new(
        Arc::clone(&control),
        Arc::clone(&procman) as Arc<dyn ProcessManager>,
        Arc::new(ConfigOwners::new(DaemonConfig::default())),
        Duration::from_secs(5),
        Duration::from_secs(1),
    );

    let err = supervisor.ensure_worker_running(A).await.unwrap_err();
    assert_eq!(err.code(), "owner_unresolved");
    assert_eq!(procman.registrations(), 0);
    assert!(!control.record(A).await.unwrap().is_started());
}

#[tokio::test]
async fn test_lock_released_while_waiting_for_startup() {
    let procman = Arc::new(ScriptedManager::new(Startup::Never));
    let (supervisor, control) = supervisor(2, Arc::clone(&procman), Duration::from_millis(500));

    let waiter = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.ensure_worker_running(A).await })
    };

    // Wait until the launch was submitted
    timeout(Duration::from_secs(1), async {
        while procman.registrations() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("launch submitted");

    // The registry is usable while the first caller waits
    let guard = timeout(Duration::from_millis(100), control.lock())
        .await
        .expect("lock must not be held across the startup wait");
    assert!(guard.record(A).unwrap().is_started());
    drop(guard);

    assert_eq!(
        supervisor.ensure_worker_running(A).await.unwrap(),
        Ensured::AlreadyStarted
    );
    assert!(waiter.await.unwrap().is_err());
}

// ============================================================================
// Listing and Signals
// ============================================================================

#[tokio::test]
async fn test_list_workers_joins_pids() {
    let procman = Arc::new(ScriptedManager::new(Startup::Immediate));
    let (supervisor, _) = supervisor(4, Arc::clone(&procman), Duration::from_secs(1));

    supervisor.ensure_worker_running(B).await.unwrap();
    supervisor.ensure_worker_running(A).await.unwrap();

    let views = supervisor.list_workers().await;
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].unit, A);
    assert_eq!(views[0].pid, Some(1001));
    assert_eq!(views[1].pid, Some(1000));

    assert_eq!(supervisor.wake(A).await, 1);
    assert_eq!(supervisor.reload_all().await, 2);
}
