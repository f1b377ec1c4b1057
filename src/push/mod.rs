//! Push protocol endpoint.
//!
//! Each upgraded WebSocket gets its own [`PushSession`] task, which owns the
//! transport for its whole life and is its only writer.
//!
//! # Architecture
//!
//! ```text
//!  client ◄──── WebSocket ────► PushSession task
//!                                 │  ▲
//!                   register/     │  │ Outbound::Notify (mpsc)
//!                   unregister    ▼  │
//!                              ClientRegistry ◄──── Router / Dispatcher
//! ```
//!
//! See [`protocol`] for the wire format and [`session`] for the state machine.

pub mod protocol;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::ClientRegistry;
use crate::constants::{
    DEFAULT_DELIVERY_TIMEOUT, DEFAULT_HELLO_TIMEOUT, DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT,
};
use crate::router::ShardMap;
use crate::storage::ChannelStore;

pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use session::{PushSession, SessionState};

/// Timing knobs for push sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSettings {
    /// Idle time before the server pings the client.
    pub ping_interval: Duration,
    /// Time allowed for the client to answer a ping.
    pub pong_timeout: Duration,
    /// Time allowed between upgrade and `hello`.
    pub hello_timeout: Duration,
    /// Bound on writing one frame / delivering one notification.
    pub delivery_timeout: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl PushSettings {
    /// How often a session re-evaluates its keepalive and handshake deadlines.
    pub fn tick_period(&self) -> Duration {
        let shortest = self
            .ping_interval
            .min(self.pong_timeout)
            .min(self.hello_timeout);
        (shortest / 2).max(Duration::from_millis(10))
    }
}

/// Everything a push session needs from the rest of the relay.
#[derive(Debug, Clone)]
pub struct PushContext {
    /// Live connection registry.
    pub registry: Arc<ClientRegistry>,
    /// Shard map, for assigning UAIDs this node owns.
    pub shards: ShardMap,
    /// Channel store, read on handshake to re-sync stale clients.
    pub store: Arc<dyn ChannelStore>,
    /// Session timing.
    pub settings: PushSettings,
    /// Cancelled when the relay shuts down.
    pub shutdown: CancellationToken,
}
