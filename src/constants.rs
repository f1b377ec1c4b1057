//! Application-wide constants for pushrelay.
//!
//! This module centralizes the defaults and protocol limits so the config
//! layer, the push handler and the router agree on them. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Listeners**: default addresses and ports
//! - **Push protocol**: keepalive, handshake and delivery windows
//! - **Routing**: forward timeouts and retry budget
//! - **Identifiers**: UAID/CHID limits

use std::time::Duration;

/// Crate version, reported by `/status/` and `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Listeners
// ============================================================================

/// Default host for the REST (and, by default, push) listener.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port for the REST (and, by default, push) listener.
pub const DEFAULT_PORT: u16 = 8080;

/// Default port of the shard listener that accepts forwarded updates.
pub const DEFAULT_SHARD_PORT: u16 = 3000;

/// Default cap on simultaneously open push connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Grace period for connection workers to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Push protocol
// ============================================================================

/// Idle time after which the server pings a client.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Time a client has to answer a server ping before it is dropped.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a freshly upgraded connection has to send its `hello`.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on handing a notification to a connection and seeing it written.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound command queue depth per connection.
pub const CONNECTION_QUEUE_CAPACITY: usize = 64;

/// WebSocket close code for protocol errors (RFC 6455).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// WebSocket close code for a normal close.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code sent when the server goes away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

// ============================================================================
// Routing
// ============================================================================

/// Per-attempt timeout for forwarding an update to a peer node.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Total forward attempts before the update is dropped.
pub const DEFAULT_FORWARD_ATTEMPTS: u32 = 2;

/// Fixed delay between forward attempts.
pub const DEFAULT_FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Depth of the update queue consumed by the update worker.
pub const DEFAULT_UPDATE_QUEUE_CAPACITY: usize = 1_024;

// ============================================================================
// Identifiers
// ============================================================================

/// Maximum length of a UAID or CHID.
pub const MAX_ID_LEN: usize = 100;

/// HTTP user agent for peer forwards.
pub fn user_agent() -> String {
    format!("pushrelay/{VERSION}")
}
