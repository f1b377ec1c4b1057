//! Pushrelay - sharded push-notification relay.
//!
//! Backend services post version bumps for `(uaid, chid)` channels; the
//! relay persists the newest version and notifies the client over its
//! WebSocket, even when that client is connected to another node of the
//! fleet.
//!
//! # Architecture
//!
//! - **Storage** - version contract: apply a version only if it is newer
//! - **Registry** - one live connection per client on this node
//! - **Push** - per-connection protocol state machine
//! - **Router** - which node owns a client; local delivery or HTTP forward
//! - **Dispatch** - persist, then route; fed by a bounded queue
//! - **Server** - listeners and the relay lifecycle
//!
//! # Modules
//!
//! - [`storage`] - channel store contract and in-memory engine
//! - [`client`] - connection handles and the client registry
//! - [`push`] - push protocol and sessions
//! - [`router`] - shard map, forwarding, shard intake
//! - [`dispatch`] - dispatcher, update queue and worker
//! - [`server`] - listeners, handlers, relay lifecycle
//! - [`config`] - configuration loading

// Library modules
pub mod client;
pub mod commands;
pub mod dispatch;
pub mod push;
pub mod router;
pub mod server;
pub mod storage;
pub mod ws;

pub mod config;
pub mod constants;
pub mod tls;
pub mod update;

// Re-export commonly used types
pub use client::{ClientRegistry, ConnectionHandle};
pub use config::RelayConfig;
pub use dispatch::{Delivery, DispatchOutcome, Dispatcher};
pub use router::Router;
pub use server::{Relay, RelayError, RunningRelay};
pub use storage::{ChannelStore, MemoryStore};
pub use update::UpdateMessage;
