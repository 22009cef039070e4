//! Client-side proxy for one remote volume meter.
//!
//! Every operation is a call on the `Volmeter` class keyed by the meter's
//! engine-assigned id. Synchronous operations surface transport, protocol and
//! status failures to the caller; fire-and-forget operations never do.
//!
//! # Example
//!
//! ```no_run
//! use meterlink_core::{Connection, EventLoop, MeterConfig, RemoteMeter, SourceId};
//! # fn run(connection: Connection) -> meterlink_core::Result<()> {
//! let host = EventLoop::new();
//! let mut meter = RemoteMeter::create(&connection, MeterConfig::default())?;
//! meter.set_update_interval(50);
//! meter.attach(SourceId(7));
//! meter.add_callback(&host, |levels| println!("{:?}", levels.peak))?;
//! host.run_for(std::time::Duration::from_secs(1));
//! meter.remove_callback(&host)?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::channel::{CallChannel, Connection};
use crate::error::{Error, Result};
use crate::host::{EventLoop, HostEvent, LoopHandle};
use crate::levels::MeterLevels;
use crate::lifecycle::ShutdownSignal;
use crate::protocol::{method, MeterId, SourceId, METER_CLASS};
use crate::schema::{decode_create_reply, decode_interval_reply, read_status};
use crate::value::WireValue;
use crate::worker::{PollWorker, WorkerParams, WorkerPhase, WorkerState, WorkerStats};

/// Scale the engine uses to map levels onto a fader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaderType {
    #[default]
    Cubic,
    Iec,
    Log,
}

impl FaderType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Cubic => 0,
            Self::Iec => 1,
            Self::Log => 2,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Cubic),
            1 => Some(Self::Iec),
            2 => Some(Self::Log),
            _ => None,
        }
    }
}

/// Options for [`RemoteMeter::create`].
#[derive(Debug, Clone, Default)]
pub struct MeterConfig {
    pub fader: FaderType,
    /// Stop signal observed by the meter's worker. Defaults to the
    /// process-wide one.
    pub shutdown: Option<ShutdownSignal>,
}

impl MeterConfig {
    pub fn new(fader: FaderType) -> Self {
        Self {
            fader,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

/// Turn a synchronous reply into an error unless its status is `Ok`.
fn check_status(reply: &[WireValue]) -> Result<()> {
    let status = read_status(reply)?;
    if status.code.is_ok() {
        Ok(())
    } else {
        Err(Error::Remote {
            code: status.code,
            message: status.message,
        })
    }
}

fn current_channel(connection: &Connection) -> Result<Arc<dyn CallChannel>> {
    connection.channel().ok_or(Error::NotConnected)
}

/// Handle to a meter object living in the engine.
pub struct RemoteMeter {
    id: MeterId,
    fader: FaderType,
    interval_ms: Arc<AtomicU32>,
    connection: Connection,
    shutdown: ShutdownSignal,
    worker: PollWorker,
    /// Host loop and generation of the current callback registration.
    subscription: Option<(LoopHandle, u64)>,
}

impl RemoteMeter {
    /// Create a meter on the engine.
    ///
    /// Fails without retrying if the engine is unreachable or answers with
    /// anything but a well-formed `Ok` reply.
    pub fn create(connection: &Connection, config: MeterConfig) -> Result<Self> {
        let channel = current_channel(connection)?;
        let reply = channel.call_synchronous(
            METER_CLASS,
            method::CREATE,
            &[WireValue::Int32(config.fader.as_i32())],
        )?;
        check_status(&reply)?;
        let created = decode_create_reply(&reply)?;
        log::info!(
            "[{}] created ({:?} fader, {} ms interval)",
            created.id,
            config.fader,
            created.interval_ms
        );

        Ok(Self {
            id: created.id,
            fader: config.fader,
            interval_ms: Arc::new(AtomicU32::new(created.interval_ms)),
            connection: connection.clone(),
            shutdown: config
                .shutdown
                .unwrap_or_else(|| ShutdownSignal::global().clone()),
            worker: PollWorker::new(created.id),
            subscription: None,
        })
    }

    pub fn id(&self) -> MeterId {
        self.id
    }

    pub fn fader(&self) -> FaderType {
        self.fader
    }

    /// Issue a synchronous call scoped to this meter and check its status.
    fn call_synchronous(&self, method: &str, extra: &[WireValue]) -> Result<Vec<WireValue>> {
        let channel = current_channel(&self.connection)?;
        let mut args: Vec<WireValue> = Vec::with_capacity(1 + extra.len());
        args.push(self.id.into());
        args.extend_from_slice(extra);
        let reply = channel.call_synchronous(METER_CLASS, method, &args)?;
        check_status(&reply)?;
        Ok(reply)
    }

    /// Issue a fire-and-forget call scoped to this meter. Failures are only logged.
    fn call(&self, method: &str, extra: &[WireValue]) {
        let Some(channel) = self.connection.channel() else {
            log::debug!("[{}] {} dropped: not connected", self.id, method);
            return;
        };
        let mut args: Vec<WireValue> = Vec::with_capacity(1 + extra.len());
        args.push(self.id.into());
        args.extend_from_slice(extra);
        if let Err(e) = channel.call(METER_CLASS, method, &args) {
            log::debug!("[{}] {} dropped: {}", self.id, method, e);
        }
    }

    /// Ask the engine to use a new update interval. Not acknowledged.
    ///
    /// The worker's cadence follows the new value from its next cycle.
    pub fn set_update_interval(&self, interval_ms: u32) {
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.call(method::SET_UPDATE_INTERVAL, &[WireValue::UInt32(interval_ms)]);
    }

    /// Fetch the interval from the engine and refresh the local copy.
    pub fn update_interval(&self) -> Result<u32> {
        let reply = self.call_synchronous(method::GET_UPDATE_INTERVAL, &[])?;
        let interval_ms = decode_interval_reply(&reply)?;
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        Ok(interval_ms)
    }

    /// The locally cached interval, without a remote call.
    pub fn cached_update_interval(&self) -> u32 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    pub fn attach(&self, source: SourceId) {
        self.call(method::ATTACH, &[source.into()]);
    }

    pub fn detach(&self) {
        self.call(method::DETACH, &[]);
    }

    /// Register `callback` and start polling.
    ///
    /// The callback runs on the thread driving `host`. A callback already
    /// registered for this meter is replaced, and its worker is stopped and
    /// restarted with the new delivery path. If the engine refuses, no
    /// worker is started and the previous registration stays in place.
    pub fn add_callback<F>(&mut self, host: &EventLoop, callback: F) -> Result<()>
    where
        F: FnMut(MeterLevels) + 'static,
    {
        self.call_synchronous(method::ADD_CALLBACK, &[])?;

        // A running worker holds the previous subscription's delivery path.
        self.worker.stop();
        let deliverer = host.subscribe(self.id, callback);
        self.subscription = Some((host.handle(), deliverer.generation()));
        let params = WorkerParams {
            id: self.id,
            connection: self.connection.clone(),
            interval_ms: self.interval_ms.clone(),
            deliverer,
            shutdown: self.shutdown.clone(),
        };
        if let Err(e) = self.worker.start(params) {
            host.unsubscribe(self.id);
            self.subscription = None;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Unregister the callback and stop polling.
    ///
    /// Once this returns `Ok`, the callback is never invoked again.
    pub fn remove_callback(&mut self, host: &EventLoop) -> Result<()> {
        self.call_synchronous(method::REMOVE_CALLBACK, &[])?;
        self.worker.stop();
        host.unsubscribe(self.id);
        self.subscription = None;
        Ok(())
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn worker_phase(&self) -> WorkerPhase {
        self.worker.phase()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    /// Whether the engine last reported this meter's reference as invalid.
    pub fn is_stale(&self) -> bool {
        self.worker.is_stale()
    }
}

impl Drop for RemoteMeter {
    fn drop(&mut self) {
        self.worker.stop();
        // The host may live on another thread, so the registry entry is
        // removed when the loop next runs.
        if let Some((host, generation)) = self.subscription.take() {
            host.post(HostEvent::Unsubscribe {
                id: self.id,
                generation,
            });
        }
    }
}

impl std::fmt::Debug for RemoteMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMeter")
            .field("id", &self.id)
            .field("fader", &self.fader)
            .field("interval_ms", &self.cached_update_interval())
            .field("worker", &self.worker)
            .finish()
    }
}
