//! Call channel abstraction and the shared connection slot.
//!
//! A [`CallChannel`] moves one request to the engine and, for synchronous
//! calls, one reply back. Implementations must tolerate concurrent calls
//! from many threads without interleaving one exchange with another.
//!
//! A [`Connection`] is the slot every proxy and worker reads the current
//! channel from. It may be empty (engine not connected yet, or the link was
//! torn down); callers treat that as "unavailable now", never as fatal.

use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::value::{ValueError, WireValue};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed the link or can no longer be reached.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A request or reply could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] ValueError),

    /// Generic I/O failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request/response link to the remote engine.
///
/// By convention the first argument of every meter call is the target
/// meter's id.
pub trait CallChannel: Send + Sync {
    /// Send a request and block until its reply arrives.
    fn call_synchronous(
        &self,
        class: &str,
        method: &str,
        args: &[WireValue],
    ) -> Result<Vec<WireValue>, ChannelError>;

    /// Send a request without waiting for (or receiving) a reply.
    ///
    /// Delivery is best-effort.
    fn call(&self, class: &str, method: &str, args: &[WireValue]) -> Result<(), ChannelError>;
}

/// Shared, swappable slot holding the current channel to the engine.
#[derive(Clone, Default)]
pub struct Connection {
    channel: Arc<RwLock<Option<Arc<dyn CallChannel>>>>,
}

impl Connection {
    /// Create an empty (disconnected) slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot that already holds `channel`.
    pub fn with_channel(channel: Arc<dyn CallChannel>) -> Self {
        let conn = Self::new();
        conn.connect(channel);
        conn
    }

    /// Install a channel, replacing any previous one.
    pub fn connect(&self, channel: Arc<dyn CallChannel>) {
        *self.channel.write().expect("Connection lock poisoned") = Some(channel);
    }

    /// Remove the current channel, returning it.
    pub fn disconnect(&self) -> Option<Arc<dyn CallChannel>> {
        self.channel.write().expect("Connection lock poisoned").take()
    }

    /// The current channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn CallChannel>> {
        self.channel.read().expect("Connection lock poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.read().expect("Connection lock poisoned").is_some()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}
