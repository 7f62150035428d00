//! Process-local wake latch.
//!
//! A latch is an "is set" flag plus a self-pipe. Signal handlers never touch
//! the flag: they are given a clone of the write end through
//! [`Latch::signal_pipe`] and only write a byte to it. A pending byte counts as
//! set; [`Latch::wait`] and [`Latch::is_set`] fold it into the flag.
//! [`Latch::reset`] clears both.

use std::io::{self, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UnixStream;

pub struct Latch {
    is_set: AtomicBool,
    tx: StdUnixStream,
    rx: UnixStream,
}

impl Latch {
    /// Creates an unset latch. Must be called inside a tokio runtime.
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = StdUnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self {
            is_set: AtomicBool::new(false),
            tx,
            rx: UnixStream::from_std(rx)?,
        })
    }

    /// Write end for a signal handler to wake the latch through.
    pub fn signal_pipe(&self) -> io::Result<StdUnixStream> {
        self.tx.try_clone()
    }

    /// Sets the latch, waking any waiter.
    pub fn set(&self) {
        if self.is_set.swap(true, Ordering::SeqCst) {
            return;
        }
        // A full pipe already holds a pending wake
        let _ = (&self.tx).write(&[1u8]);
    }

    /// Clears the latch and discards pending wakeups.
    pub fn reset(&self) {
        self.is_set.store(false, Ordering::SeqCst);
        self.drain();
    }

    pub fn is_set(&self) -> bool {
        if self.drain() {
            self.is_set.store(true, Ordering::SeqCst);
        }
        self.is_set.load(Ordering::SeqCst)
    }

    /// Waits until the latch is set. Returns immediately if it already is.
    pub async fn wait(&self) -> io::Result<()> {
        loop {
            if self.is_set() {
                return Ok(());
            }
            self.rx.readable().await?;
        }
    }

    /// Empties the pipe, returning whether any wake was pending.
    fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut woken = false;
        loop {
            match self.rx.try_read(&mut buf) {
                Ok(0) => break,
                Ok(_) => woken = true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        woken
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("is_set", &self.is_set.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_returns_when_already_set() {
        let latch = Latch::new().unwrap();
        latch.set();
        assert!(latch.is_set());
        timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_wakes_waiter() {
        let latch = Arc::new(Latch::new().unwrap());
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.set();

        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_blocks_again() {
        let latch = Latch::new().unwrap();
        latch.set();
        latch.set();
        latch.reset();
        assert!(!latch.is_set());

        let res = timeout(Duration::from_millis(50), latch.wait()).await;
        assert!(res.is_err(), "reset latch must not wake");
    }

    #[tokio::test]
    async fn test_byte_on_signal_pipe_sets_latch() {
        let latch = Latch::new().unwrap();
        let mut pipe = latch.signal_pipe().unwrap();
        pipe.write_all(&[1]).unwrap();

        timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(latch.is_set());

        latch.reset();
        assert!(!latch.is_set());
    }
}
