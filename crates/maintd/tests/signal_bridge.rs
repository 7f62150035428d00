//! Delivers real signals to the bridge's installed handlers.
//!
//! Kept in its own test binary: the handlers are process-wide.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use maintd::worker::{Latch, ReloadFlag, SignalBridge};

#[tokio::test]
async fn test_sighup_and_sigusr1_reach_the_bridge() {
    let latch = Arc::new(Latch::new().unwrap());
    let reload = Arc::new(ReloadFlag::new());
    let bridge = Arc::new(SignalBridge::new(Arc::clone(&reload), Arc::clone(&latch)));
    let _guard = bridge.install().unwrap();

    // SAFETY: a handler for SIGHUP is installed above
    assert_eq!(unsafe { libc::raise(libc::SIGHUP) }, 0);
    timeout(Duration::from_secs(1), latch.wait())
        .await
        .expect("SIGHUP must set the latch")
        .unwrap();
    assert!(reload.take(), "SIGHUP must raise the reload flag");

    latch.reset();

    // SAFETY: a handler for SIGUSR1 is installed above
    assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
    timeout(Duration::from_secs(1), latch.wait())
        .await
        .expect("SIGUSR1 must set the latch")
        .unwrap();
    assert!(!reload.is_raised(), "wake must not request a reload");
}
