//! Background polling worker for one remote meter.
//!
//! The worker thread alternates between waiting and polling:
//!
//! ```text
//! Idle ──start──▶ Waiting ──timeout / non-stop wake──▶ Polling
//!                    ▲                                    │
//!                    └──────────── cycle done ────────────┘
//! Waiting / Polling ──stop observed or fatal status──▶ Stopped
//! ```
//!
//! Each cycle issues one synchronous `Query`, decodes the reply and hands the
//! reading to the host. The stop flags are checked before and after every
//! wait, and a stop request wakes the wait immediately, so shutdown takes at
//! most one in-flight call. The cadence is a target: call latency is
//! subtracted from the next wait.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::Connection;
use crate::delivery::{Deliverer, Delivery};
use crate::lifecycle::{Registration, ShutdownSignal, WakeSignal};
use crate::protocol::{method, ErrorCode, MeterId, METER_CLASS};
use crate::schema::{decode_levels, read_status};

/// Control state of a worker, as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
}

/// Where the worker thread currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    Idle = 0,
    Waiting = 1,
    Polling = 2,
    Stopped = 3,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::Polling,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Result of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A reading was decoded and handed to the host.
    Delivered,
    /// Nothing to deliver this cycle (no connection, bad reply, stale reference).
    Empty,
    /// The engine reported an unrecoverable error; the worker exits.
    Fatal,
}

/// Counters and flags shared between a worker thread and its owner.
#[derive(Debug, Default)]
struct WorkerStatus {
    phase: AtomicU8,
    stale: AtomicBool,
    cycles: AtomicU64,
    delivered: AtomicU64,
    empty: AtomicU64,
}

impl WorkerStatus {
    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn record(&self, outcome: CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CycleOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            CycleOutcome::Empty => {
                self.empty.fetch_add(1, Ordering::Relaxed);
            }
            CycleOutcome::Fatal => {}
        }
    }
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub cycles: u64,
    pub delivered: u64,
    pub empty: u64,
}

/// Everything a worker thread needs to poll one meter.
#[derive(Clone)]
pub struct WorkerParams {
    pub id: MeterId,
    pub connection: Connection,
    /// Poll interval in milliseconds, shared with the owning proxy.
    pub interval_ms: Arc<AtomicU32>,
    pub deliverer: Deliverer,
    pub shutdown: ShutdownSignal,
}

/// State owned by the worker thread.
struct PollLoop {
    params: WorkerParams,
    stop: Arc<AtomicBool>,
    wake: WakeSignal,
    status: Arc<WorkerStatus>,
}

impl PollLoop {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.params.shutdown.is_triggered()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.params.interval_ms.load(Ordering::Relaxed)))
    }

    fn run(self) {
        let id = self.params.id;
        log::debug!("[{}] poll worker started", id);

        let mut wait = self.interval();
        loop {
            self.status.set_phase(WorkerPhase::Waiting);
            if self.should_stop() {
                break;
            }
            if !wait.is_zero() {
                self.wake.wait_timeout(wait);
            }
            if self.should_stop() {
                break;
            }

            self.status.set_phase(WorkerPhase::Polling);
            let started = Instant::now();
            let outcome = self.run_cycle();
            self.status.record(outcome);
            log::trace!("[{}] cycle {:?} in {:?}", id, outcome, started.elapsed());

            if outcome == CycleOutcome::Fatal {
                break;
            }
            wait = self.interval().saturating_sub(started.elapsed());
        }

        self.status.set_phase(WorkerPhase::Stopped);
        log::debug!("[{}] poll worker exited", id);
    }

    fn set_stale(&self, stale: bool) {
        let was = self.status.stale.swap(stale, Ordering::SeqCst);
        if stale && !was {
            log::warn!("[{}] meter reference is stale, still polling", self.params.id);
        } else if !stale && was {
            log::info!("[{}] meter reference resolved again", self.params.id);
        }
    }

    fn run_cycle(&self) -> CycleOutcome {
        let id = self.params.id;
        let Some(channel) = self.params.connection.channel() else {
            log::trace!("[{}] no connection, skipping cycle", id);
            return CycleOutcome::Empty;
        };

        let reply = match channel.call_synchronous(METER_CLASS, method::QUERY, &[id.into()]) {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("[{}] query failed: {}", id, e);
                return CycleOutcome::Empty;
            }
        };

        let status = match read_status(&reply) {
            Ok(status) => status,
            Err(e) => {
                log::debug!("[{}] unusable query reply: {}", id, e);
                return CycleOutcome::Empty;
            }
        };

        match status.code {
            ErrorCode::Ok => match decode_levels(&reply) {
                Ok(levels) => {
                    self.set_stale(false);
                    if self.params.deliverer.deliver(levels) == Delivery::Dropped {
                        log::trace!("[{}] host gone, reading dropped", id);
                    }
                    CycleOutcome::Delivered
                }
                Err(e) => {
                    log::debug!("[{}] malformed reading: {}", id, e);
                    CycleOutcome::Empty
                }
            },
            ErrorCode::InvalidReference => {
                self.set_stale(true);
                CycleOutcome::Empty
            }
            code => {
                log::error!(
                    "[{}] meter query failed with {}: {}; stopping worker",
                    id,
                    code,
                    status.message.as_deref().unwrap_or("no message")
                );
                CycleOutcome::Fatal
            }
        }
    }
}

/// Owner-side control of one meter's polling thread.
///
/// At most one thread runs per worker. [`start`](Self::start) and
/// [`stop`](Self::stop) are idempotent, and dropping the worker stops it.
pub struct PollWorker {
    id: MeterId,
    state: WorkerState,
    stop: Arc<AtomicBool>,
    wake: Option<WakeSignal>,
    registration: Option<Registration>,
    thread: Option<JoinHandle<()>>,
    status: Arc<WorkerStatus>,
}

impl PollWorker {
    pub fn new(id: MeterId) -> Self {
        Self {
            id,
            state: WorkerState::Stopped,
            stop: Arc::new(AtomicBool::new(true)),
            wake: None,
            registration: None,
            thread: None,
            status: Arc::new(WorkerStatus::default()),
        }
    }

    pub fn id(&self) -> MeterId {
        self.id
    }

    /// `Stopped` once the thread has exited, even before it is reaped.
    pub fn state(&self) -> WorkerState {
        if self.has_exited() {
            WorkerState::Stopped
        } else {
            self.state
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.status.phase.load(Ordering::SeqCst))
    }

    /// Whether the last answered query reported an invalid reference.
    pub fn is_stale(&self) -> bool {
        self.status.stale.load(Ordering::SeqCst)
    }

    /// Whether the thread has exited on its own (fatal status or shutdown).
    pub fn has_exited(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| t.is_finished())
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            cycles: self.status.cycles.load(Ordering::Relaxed),
            delivered: self.status.delivered.load(Ordering::Relaxed),
            empty: self.status.empty.load(Ordering::Relaxed),
        }
    }

    /// Launch the polling thread.
    ///
    /// No-op while a thread is running. A thread that already exited on its
    /// own is reaped first and replaced.
    pub fn start(&mut self, params: WorkerParams) -> io::Result<()> {
        if self.state == WorkerState::Running {
            if !self.has_exited() {
                log::debug!("[{}] poll worker already running", self.id);
                return Ok(());
            }
            self.stop();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let wake = WakeSignal::new(format!("meter-poll-{}", self.id.as_u64()));
        let registration = params.shutdown.register(wake.clone());
        let status = Arc::new(WorkerStatus::default());
        status.set_phase(WorkerPhase::Idle);

        let poll_loop = PollLoop {
            params,
            stop: stop.clone(),
            wake: wake.clone(),
            status: status.clone(),
        };
        let thread = thread::Builder::new()
            .name(wake.name().to_string())
            .spawn(move || poll_loop.run())?;

        self.stop = stop;
        self.wake = Some(wake);
        self.registration = Some(registration);
        self.status = status;
        self.thread = Some(thread);
        self.state = WorkerState::Running;
        log::info!("[{}] poll worker running", self.id);
        Ok(())
    }

    /// Signal the thread, wake it, join it and release its wake primitive.
    ///
    /// No-op when already stopped; safe after the thread exited by itself.
    pub fn stop(&mut self) {
        if self.state == WorkerState::Stopped {
            return;
        }
        self.state = WorkerState::Stopped;
        self.stop.store(true, Ordering::SeqCst);
        if let Some(wake) = &self.wake {
            wake.wake();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[{}] poll worker panicked", self.id);
            }
        }
        self.registration = None;
        self.wake = None;
        log::info!("[{}] poll worker stopped", self.id);
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollWorker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("phase", &self.phase())
            .finish()
    }
}
