//! Live client connections.
//!
//! A push connection is owned by its session task (see [`crate::push`]),
//! which is the only writer of the transport. Everyone else (the registry,
//! the router, the dispatcher) holds a cheap [`ConnectionHandle`] that can
//! only queue commands for that task and read the connection's channel
//! state.
//!
//! # Modules
//!
//! - [`registry`] - UAID → handle map enforcing one connection per client

pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::update::Version;

pub use registry::ClientRegistry;

/// Failure to hand a notification to a local connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection closed before the frame was written.
    #[error("connection closed")]
    Closed,
    /// The frame was not written within the delivery timeout.
    #[error("delivery timed out")]
    Timeout,
}

/// Command queued for a connection's session task.
#[derive(Debug)]
pub enum Outbound {
    /// Write a `notification` frame, then report completion on `done`.
    Notify {
        /// Channel identifier.
        chid: String,
        /// Version to announce.
        version: Version,
        /// Completed once the frame is fully written (or failed).
        done: oneshot::Sender<Result<(), DeliveryError>>,
    },
}

/// Per-connection client state shared between the session and the registry.
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Last version the client acknowledged (or announced) per channel.
    pub channels: HashMap<String, Version>,
    /// Last time anything arrived from the client.
    pub last_activity: DateTime<Utc>,
}

impl ClientState {
    fn new(channels: HashMap<String, Version>) -> Self {
        Self {
            channels,
            last_activity: Utc::now(),
        }
    }
}

/// Cloneable handle to one live client connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    uaid: String,
    conn_id: u64,
    commands: mpsc::Sender<Outbound>,
    state: Arc<Mutex<ClientState>>,
    evicted: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle for a freshly handshaken connection.
    ///
    /// `commands` is the sending side of the session task's command queue.
    pub fn new(
        uaid: String,
        channels: HashMap<String, Version>,
        commands: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            uaid,
            conn_id: next_conn_id(),
            commands,
            state: Arc::new(Mutex::new(ClientState::new(channels))),
            evicted: CancellationToken::new(),
        }
    }

    /// Client identifier.
    pub fn uaid(&self) -> &str {
        &self.uaid
    }

    /// Process-unique identifier of this particular connection.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Push a notification and wait until it has been written to the transport.
    pub async fn notify(
        &self,
        chid: &str,
        version: Version,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let (done, written) = oneshot::channel();
        let command = Outbound::Notify {
            chid: chid.to_string(),
            version,
            done,
        };

        let delivery = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| DeliveryError::Closed)?;
            written.await.map_err(|_| DeliveryError::Closed)?
        };

        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Ask the owning session to close because a newer connection replaced it.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    /// Whether [`evict`](Self::evict) has been called.
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Token the session task watches for eviction.
    pub fn eviction_token(&self) -> CancellationToken {
        self.evicted.clone()
    }

    /// Whether the session task has gone away.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Record an acknowledged version. Never moves a channel backwards.
    pub fn record_ack(&self, chid: &str, version: Version) {
        let mut state = self.lock_state();
        let acked = state.channels.entry(chid.to_string()).or_insert(version);
        if version > *acked {
            *acked = version;
        }
        state.last_activity = Utc::now();
    }

    /// Add a channel subscription (version 0 if unknown).
    pub fn subscribe(&self, chid: &str) {
        let mut state = self.lock_state();
        state.channels.entry(chid.to_string()).or_insert(0);
    }

    /// Drop a channel subscription.
    pub fn unsubscribe(&self, chid: &str) -> bool {
        self.lock_state().channels.remove(chid).is_some()
    }

    /// Note inbound traffic.
    pub fn touch(&self) {
        self.lock_state().last_activity = Utc::now();
    }

    /// Last acknowledged version of a channel.
    pub fn last_acked(&self, chid: &str) -> Option<Version> {
        self.lock_state().channels.get(chid).copied()
    }

    /// Copy of the connection's client state.
    pub fn snapshot(&self) -> ClientState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_conn_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
