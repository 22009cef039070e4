//! meterlink core - Remote volume meters over a call channel.
//!
//! This crate provides the client side of a meter bridge to an
//! out-of-process audio engine:
//!
//! - **Values** - Tagged wire values and their byte encoding
//! - **Schema** - Typed decoding of positional reply lists
//! - **Channel** - Synchronous and fire-and-forget calls, plus a stream transport
//! - **Meter** - [`RemoteMeter`], a proxy keyed by an engine-assigned id
//! - **Worker** - Per-meter polling thread with interruptible waits
//! - **Host** - Single-threaded event loop that runs user callbacks
//! - **Lifecycle** - Per-worker wake signals and a process-wide shutdown
//! - **Engine** - A simulated engine for local use and tests
//!
//! # Architecture
//!
//! Registering a callback starts one polling thread per meter. Each cycle
//! the thread issues a synchronous `Query`, decodes the reading and hands it
//! to the host through a single-slot [`Deliverer`]. The host drains its
//! [`EventLoop`] on its own thread and invokes callbacks there; workers never
//! touch callbacks and never block on the host.

pub mod channel;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod host;
pub mod levels;
pub mod lifecycle;
pub mod meter;
pub mod protocol;
pub mod schema;
pub mod transport;
pub mod value;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use channel::{CallChannel, ChannelError, Connection};
pub use config::Config;
pub use delivery::{Deliverer, Delivery, DeliverySlot};
pub use engine::SimulatedEngine;
pub use error::{Error, Result};
pub use host::{EventLoop, HostEvent, LoopHandle, MeterCallback};
pub use levels::{ChannelLevel, MeterLevels};
pub use lifecycle::{stop_all_workers, ShutdownSignal, WakeSignal};
pub use meter::{FaderType, MeterConfig, RemoteMeter};
pub use protocol::{ErrorCode, MeterId, SourceId, METER_CLASS};
pub use schema::{decode_levels, LevelsSchema, SchemaError};
pub use transport::{serve_stream, serve_tcp, Service, StreamChannel};
pub use value::{decode_values, encode_values, ValueError, WireValue};
pub use worker::{CycleOutcome, PollWorker, WorkerPhase, WorkerState, WorkerStats};
