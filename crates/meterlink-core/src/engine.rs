//! In-process stand-in for the remote engine.
//!
//! [`SimulatedEngine`] keeps a table of meters and audio sources and answers
//! `Volmeter` calls the way a real engine would. It implements both
//! [`Service`] (to be served over a stream) and [`CallChannel`] (to be
//! called directly, without a transport).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::channel::{CallChannel, ChannelError};
use crate::levels::{ChannelLevel, MeterLevels};
use crate::meter::FaderType;
use crate::protocol::{method, ErrorCode, MeterId, SourceId, METER_CLASS};
use crate::schema::LevelsSchema;
use crate::transport::Service;
use crate::value::WireValue;

/// Interval handed out to newly created meters.
pub const DEFAULT_INTERVAL_MS: u32 = 50;

/// Engine-side state of one meter.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterEntry {
    pub fader: FaderType,
    pub interval_ms: u32,
    pub source: Option<SourceId>,
    pub callback: bool,
}

#[derive(Debug)]
struct EngineState {
    next_id: u64,
    default_interval_ms: u32,
    meters: HashMap<MeterId, MeterEntry>,
    /// Source id → channel count.
    sources: HashMap<SourceId, usize>,
}

/// Simulated engine answering meter calls with synthetic levels.
#[derive(Clone)]
pub struct SimulatedEngine {
    state: Arc<RwLock<EngineState>>,
    started: Instant,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn error(code: ErrorCode, message: impl Into<String>) -> Vec<WireValue> {
    vec![code.into(), WireValue::String(message.into())]
}

fn ok() -> Vec<WireValue> {
    vec![ErrorCode::Ok.into()]
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::with_default_interval(DEFAULT_INTERVAL_MS)
    }

    pub fn with_default_interval(interval_ms: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState {
                next_id: 1,
                default_interval_ms: interval_ms,
                meters: HashMap::new(),
                sources: HashMap::new(),
            })),
            started: Instant::now(),
        }
    }

    fn with_state_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&EngineState) -> R,
    {
        let state = self.state.read().expect("Engine lock poisoned");
        f(&state)
    }

    fn with_state_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut EngineState) -> R,
    {
        let mut state = self.state.write().expect("Engine lock poisoned");
        f(&mut state)
    }

    /// Register an audio source with `channels` channels.
    pub fn add_source(&self, id: SourceId, channels: usize) {
        self.with_state_write(|s| s.sources.insert(id, channels));
        log::debug!("Source {} added ({} channels)", id.as_u64(), channels);
    }

    /// Remove a source. Meters attached to it start reporting an invalid reference.
    pub fn remove_source(&self, id: SourceId) -> bool {
        self.with_state_write(|s| s.sources.remove(&id).is_some())
    }

    /// Drop a meter engine-side, as if the engine released it.
    pub fn remove_meter(&self, id: MeterId) -> bool {
        self.with_state_write(|s| s.meters.remove(&id).is_some())
    }

    pub fn meter(&self, id: MeterId) -> Option<MeterEntry> {
        self.with_state_read(|s| s.meters.get(&id).cloned())
    }

    pub fn meter_count(&self) -> usize {
        self.with_state_read(|s| s.meters.len())
    }

    /// Synthetic reading for a source with `channels` channels, in dBFS.
    fn synthesize(&self, channels: usize) -> MeterLevels {
        let t = self.started.elapsed().as_secs_f32();
        (0..channels)
            .map(|ch| {
                let wobble = (t * 2.0 + ch as f32 * 0.7).sin();
                let magnitude = -24.0 + 12.0 * wobble;
                let peak = (magnitude + 6.0).min(0.0);
                ChannelLevel {
                    magnitude,
                    peak,
                    input_peak: peak,
                }
            })
            .collect()
    }

    fn create(&self, args: &[WireValue]) -> Vec<WireValue> {
        let Some(raw) = args.first().and_then(WireValue::as_i32) else {
            return error(ErrorCode::Error, "Create expects a fader type");
        };
        let Some(fader) = FaderType::from_i32(raw) else {
            return error(ErrorCode::Error, format!("Unknown fader type {}", raw));
        };
        let (id, interval_ms) = self.with_state_write(|s| {
            let id = MeterId(s.next_id);
            s.next_id += 1;
            s.meters.insert(
                id,
                MeterEntry {
                    fader,
                    interval_ms: s.default_interval_ms,
                    source: None,
                    callback: false,
                },
            );
            (id, s.default_interval_ms)
        });
        log::debug!("Created {} ({:?})", id, fader);
        vec![
            ErrorCode::Ok.into(),
            WireValue::UInt64(id.as_u64()),
            WireValue::UInt32(interval_ms),
        ]
    }

    fn query(&self, id: MeterId) -> Vec<WireValue> {
        let channels = self.with_state_read(|s| match s.meters.get(&id) {
            None => None,
            Some(MeterEntry { source: None, .. }) => Some(0),
            Some(MeterEntry {
                source: Some(source),
                ..
            }) => s.sources.get(source).copied(),
        });
        match channels {
            Some(n) => LevelsSchema::encode(&self.synthesize(n)),
            None => vec![ErrorCode::InvalidReference.into()],
        }
    }

    /// Apply `f` to the meter addressed by `args[0]`.
    fn with_meter<F>(&self, args: &[WireValue], f: F) -> Vec<WireValue>
    where
        F: FnOnce(&mut MeterEntry) -> Vec<WireValue>,
    {
        let Some(id) = args.first().and_then(WireValue::as_u64).map(MeterId) else {
            return error(ErrorCode::Error, "Missing meter id");
        };
        self.with_state_write(|s| match s.meters.get_mut(&id) {
            Some(entry) => f(entry),
            None => error(ErrorCode::NotFound, format!("No such meter {}", id)),
        })
    }

    fn dispatch(&self, method: &str, args: &[WireValue]) -> Vec<WireValue> {
        match method {
            method::CREATE => self.create(args),
            method::QUERY => match args.first().and_then(WireValue::as_u64) {
                Some(id) => self.query(MeterId(id)),
                None => error(ErrorCode::Error, "Missing meter id"),
            },
            method::GET_UPDATE_INTERVAL => self.with_meter(args, |m| {
                vec![ErrorCode::Ok.into(), WireValue::UInt32(m.interval_ms)]
            }),
            method::SET_UPDATE_INTERVAL => {
                let Some(ms) = args.get(1).and_then(WireValue::as_u32) else {
                    return error(ErrorCode::Error, "SetUpdateInterval expects milliseconds");
                };
                self.with_meter(args, |m| {
                    m.interval_ms = ms;
                    ok()
                })
            }
            method::ATTACH => {
                let Some(source) = args.get(1).and_then(WireValue::as_u64) else {
                    return error(ErrorCode::Error, "Attach expects a source id");
                };
                self.with_meter(args, |m| {
                    m.source = Some(SourceId(source));
                    ok()
                })
            }
            method::DETACH => self.with_meter(args, |m| {
                m.source = None;
                ok()
            }),
            method::ADD_CALLBACK => self.with_meter(args, |m| {
                m.callback = true;
                ok()
            }),
            method::REMOVE_CALLBACK => self.with_meter(args, |m| {
                m.callback = false;
                ok()
            }),
            other => error(ErrorCode::Error, format!("Unknown method {}", other)),
        }
    }
}

impl Service for SimulatedEngine {
    fn handle(&self, class: &str, method: &str, args: &[WireValue]) -> Vec<WireValue> {
        if class != METER_CLASS {
            return error(ErrorCode::Error, format!("Unknown class {}", class));
        }
        self.dispatch(method, args)
    }
}

impl CallChannel for SimulatedEngine {
    fn call_synchronous(
        &self,
        class: &str,
        method: &str,
        args: &[WireValue],
    ) -> Result<Vec<WireValue>, ChannelError> {
        Ok(self.handle(class, method, args))
    }

    fn call(&self, class: &str, method: &str, args: &[WireValue]) -> Result<(), ChannelError> {
        self.handle(class, method, args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Connection;
    use crate::host::EventLoop;
    use crate::lifecycle::ShutdownSignal;
    use crate::meter::{MeterConfig, RemoteMeter};
    use crate::schema::{decode_levels, read_status};
    use crate::transport::{serve_tcp, StreamChannel};
    use crate::worker::WorkerState;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn config() -> MeterConfig {
        MeterConfig::new(FaderType::Log).with_shutdown(ShutdownSignal::new())
    }

    fn status(reply: &[WireValue]) -> ErrorCode {
        read_status(reply).unwrap().code
    }

    #[test]
    fn test_query_reflects_attached_source() {
        let engine = SimulatedEngine::new();
        engine.add_source(SourceId(5), 2);

        let reply = engine.handle(METER_CLASS, method::CREATE, &[WireValue::Int32(2)]);
        assert_eq!(status(&reply), ErrorCode::Ok);
        let id = reply[1].clone();
        assert_eq!(engine.meter(MeterId(1)).unwrap().fader, FaderType::Log);

        // No source yet: zero channels.
        let reply = engine.handle(METER_CLASS, method::QUERY, &[id.clone()]);
        assert_eq!(decode_levels(&reply).unwrap().channels(), 0);

        engine.handle(METER_CLASS, method::ATTACH, &[id.clone(), WireValue::UInt64(5)]);
        let reply = engine.handle(METER_CLASS, method::QUERY, &[id.clone()]);
        let levels = decode_levels(&reply).unwrap();
        assert_eq!(levels.channels(), 2);
        assert!(levels.iter().all(|l| l.magnitude <= l.peak && l.peak <= 0.0));

        // Source gone: the reference is invalid but the meter still exists.
        assert!(engine.remove_source(SourceId(5)));
        let reply = engine.handle(METER_CLASS, method::QUERY, &[id]);
        assert_eq!(status(&reply), ErrorCode::InvalidReference);
    }

    #[test]
    fn test_unknown_targets() {
        let engine = SimulatedEngine::new();
        let reply = engine.handle(METER_CLASS, method::QUERY, &[WireValue::UInt64(99)]);
        assert_eq!(status(&reply), ErrorCode::InvalidReference);

        let reply = engine.handle(
            METER_CLASS,
            method::GET_UPDATE_INTERVAL,
            &[WireValue::UInt64(99)],
        );
        assert_eq!(status(&reply), ErrorCode::NotFound);

        let reply = engine.handle("Fader", method::QUERY, &[]);
        assert_eq!(status(&reply), ErrorCode::Error);

        let reply = engine.handle(METER_CLASS, "Explode", &[]);
        let st = read_status(&reply).unwrap();
        assert_eq!(st.code, ErrorCode::Error);
        assert_eq!(st.message.as_deref(), Some("Unknown method Explode"));

        let reply = engine.handle(METER_CLASS, method::CREATE, &[WireValue::Int32(7)]);
        assert_eq!(status(&reply), ErrorCode::Error);
    }

    #[test]
    fn test_meter_lifecycle_in_process() {
        let engine = SimulatedEngine::with_default_interval(5);
        engine.add_source(SourceId(1), 2);
        let connection = Connection::with_channel(Arc::new(engine.clone()));

        let mut meter = RemoteMeter::create(&connection, config()).unwrap();
        meter.set_update_interval(10);
        assert_eq!(meter.update_interval().unwrap(), 10);
        meter.attach(SourceId(1));
        assert_eq!(engine.meter(meter.id()).unwrap().source, Some(SourceId(1)));

        let host = EventLoop::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        meter
            .add_callback(&host, move |levels| sink.borrow_mut().push(levels.channels()))
            .unwrap();
        assert!(engine.meter(meter.id()).unwrap().callback);

        host.run_for(Duration::from_millis(100));
        assert!(!seen.borrow().is_empty());
        assert!(seen.borrow().iter().all(|&n| n == 2));

        meter.remove_callback(&host).unwrap();
        assert!(!engine.meter(meter.id()).unwrap().callback);
        meter.detach();
        assert_eq!(engine.meter(meter.id()).unwrap().source, None);
    }

    #[test]
    fn test_removed_meter_goes_stale_and_keeps_running() {
        let engine = SimulatedEngine::with_default_interval(5);
        let connection = Connection::with_channel(Arc::new(engine.clone()));
        let mut meter = RemoteMeter::create(&connection, config()).unwrap();
        let host = EventLoop::new();
        meter.add_callback(&host, |_| {}).unwrap();

        assert!(engine.remove_meter(meter.id()));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !meter.is_stale() && std::time::Instant::now() < deadline {
            host.run_for(Duration::from_millis(10));
        }
        assert!(meter.is_stale());
        assert_eq!(meter.worker_state(), WorkerState::Running);

        // The engine no longer knows the meter, so unregistering fails remotely.
        assert!(meter.remove_callback(&host).is_err());
    }

    #[test]
    fn test_meter_over_tcp() {
        let engine = SimulatedEngine::with_default_interval(10);
        engine.add_source(SourceId(3), 1);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let service: Arc<dyn Service> = Arc::new(engine.clone());
        thread::spawn(move || serve_tcp(listener, service));

        let channel = StreamChannel::connect_tcp(addr).unwrap();
        let connection = Connection::with_channel(Arc::new(channel));
        let mut meter = RemoteMeter::create(&connection, config()).unwrap();
        meter.attach(SourceId(3));

        let host = EventLoop::new();
        let seen = Rc::new(RefCell::new(0usize));
        let sink = seen.clone();
        meter
            .add_callback(&host, move |levels| {
                assert_eq!(levels.channels(), 1);
                *sink.borrow_mut() += 1;
            })
            .unwrap();

        host.run_for(Duration::from_millis(150));
        meter.remove_callback(&host).unwrap();
        assert!(*seen.borrow() > 0);
        assert_eq!(engine.meter_count(), 1);
    }
}
