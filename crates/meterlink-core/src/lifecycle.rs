//! Stop flags and wake primitives for polling workers.
//!
//! Every worker owns a [`WakeSignal`] it blocks on between cycles, and checks
//! two flags: its own stop flag and a [`ShutdownSignal`] shared by many
//! workers. Triggering the shutdown signal sets the flag and wakes every
//! registered worker, so a process-wide stop reaches workers without the
//! caller tracking each instance.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

static GLOBAL_SHUTDOWN: OnceLock<ShutdownSignal> = OnceLock::new();

/// Interruptible wait primitive owned by one worker.
///
/// Holds at most one pending wake: waking an already-woken signal is a
/// no-op, and one wait consumes it.
#[derive(Clone)]
pub struct WakeSignal {
    name: Arc<str>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = bounded(1);
        Self {
            name: Arc::from(name.into()),
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the waiter, or leave a pending wake if none is blocked.
    pub fn wake(&self) {
        let _ = self.tx.try_send(());
    }

    /// Block until woken or `timeout` elapses.
    ///
    /// Returns `true` if woken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // Unreachable while we hold our own sender.
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl std::fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSignal")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct ShutdownInner {
    triggered: AtomicBool,
    next_key: AtomicU64,
    wakers: Mutex<HashMap<u64, WakeSignal>>,
}

/// Broadcast stop flag observed by every worker registered with it.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                triggered: AtomicBool::new(false),
                next_key: AtomicU64::new(0),
                wakers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The process-wide signal used when no other is configured.
    pub fn global() -> &'static ShutdownSignal {
        GLOBAL_SHUTDOWN.get_or_init(ShutdownSignal::new)
    }

    /// Set the flag and wake every registered worker.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let wakers = self.inner.wakers.lock().expect("Shutdown lock poisoned");
        log::info!("Shutdown triggered, waking {} workers", wakers.len());
        for waker in wakers.values() {
            waker.wake();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Number of workers currently registered.
    pub fn registered(&self) -> usize {
        self.inner.wakers.lock().expect("Shutdown lock poisoned").len()
    }

    /// Register a worker's wake signal until the returned guard drops.
    pub fn register(&self, waker: WakeSignal) -> Registration {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner
            .wakers
            .lock()
            .expect("Shutdown lock poisoned")
            .insert(key, waker);
        Registration {
            signal: self.clone(),
            key,
        }
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .field("registered", &self.registered())
            .finish()
    }
}

/// Keeps a wake signal registered with a [`ShutdownSignal`].
pub struct Registration {
    signal: ShutdownSignal,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut wakers) = self.signal.inner.wakers.lock() {
            wakers.remove(&self.key);
        }
    }
}

/// Trigger the process-wide shutdown signal.
pub fn stop_all_workers() {
    ShutdownSignal::global().trigger();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_wake() {
        let wake = WakeSignal::new("test");
        let start = Instant::now();
        assert!(!wake.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pending_wake_is_consumed_once() {
        let wake = WakeSignal::new("test");
        wake.wake();
        wake.wake();
        assert!(wake.wait_timeout(Duration::from_millis(1)));
        assert!(!wake.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wake_interrupts_blocked_waiter() {
        let wake = WakeSignal::new("test");
        let waiter = wake.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let woken = waiter.wait_timeout(Duration::from_secs(10));
            (woken, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        wake.wake();
        let (woken, elapsed) = handle.join().unwrap();
        assert!(woken);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_trigger_wakes_registered_workers() {
        let shutdown = ShutdownSignal::new();
        let a = WakeSignal::new("a");
        let b = WakeSignal::new("b");
        let _ra = shutdown.register(a.clone());
        let rb = shutdown.register(b.clone());
        assert_eq!(shutdown.registered(), 2);

        drop(rb);
        assert_eq!(shutdown.registered(), 1);

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(a.wait_timeout(Duration::from_millis(1)));
        assert!(!b.wait_timeout(Duration::from_millis(1)));
    }
}
