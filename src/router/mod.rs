//! Update routing between nodes.
//!
//! The router decides whether the connection for a client lives on this
//! node or on a peer, and either hands the update to the local connection or
//! forwards it to the owner's shard listener. A live local connection always
//! wins over the shard map.
//!
//! # Architecture
//!
//! ```text
//!                      ┌─ connected/owned ► ClientRegistry ──► PushSession
//! Dispatcher ─► Router ┤
//!                      └─ remote owner ─► Forwarder ──HTTP──► peer /route/{uaid}
//!                                                               │
//!                    peer's UpdateQueue ◄── inbound::route_update ┘
//! ```
//!
//! # Modules
//!
//! - [`shard`] - UAID → node resolution
//! - [`forward`] - outbound HTTP forwarding with a bounded retry budget
//! - [`inbound`] - shard listener endpoint accepting forwarded updates

pub mod forward;
pub mod inbound;
pub mod shard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::client::{ClientRegistry, DeliveryError};
use crate::update::UpdateMessage;

pub use forward::{ForwardSettings, Forwarder};
pub use shard::{NodeAddress, ShardMap};

/// Routing failure. The update was persisted; only its delivery is lost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The peer did not answer within the forward timeout.
    #[error("forward to {node} timed out")]
    Timeout {
        /// Target node.
        node: NodeAddress,
    },
    /// The peer could not be reached.
    #[error("peer {node} unreachable: {reason}")]
    Unreachable {
        /// Target node.
        node: NodeAddress,
        /// Transport error.
        reason: String,
    },
    /// The peer answered with a non-success status.
    #[error("peer {node} rejected forward with HTTP {status}")]
    Rejected {
        /// Target node.
        node: NodeAddress,
        /// HTTP status returned.
        status: u16,
    },
    /// The local connection went away mid-delivery.
    #[error("local delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    /// The router has been shut down.
    #[error("router closed")]
    Closed,
    /// The HTTP client could not be built.
    #[error("http client: {0}")]
    Client(String),
}

/// Where a routed update ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Written to the client's local connection.
    Delivered,
    /// Owned locally but the client is not connected.
    NotConnected,
    /// Handed to the owning peer.
    Forwarded(NodeAddress),
}

/// Where [`Router::route`] sends an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    /// This node: the client is connected here or owned here.
    Local,
    /// The owning peer.
    Remote(NodeAddress),
}

/// Resolves client ownership and delivers or forwards updates.
#[derive(Debug)]
pub struct Router {
    shards: ShardMap,
    registry: Arc<ClientRegistry>,
    forwarder: Forwarder,
    delivery_timeout: Duration,
    accepting: AtomicBool,
}

impl Router {
    /// Create a router over a shard map.
    pub fn new(
        shards: ShardMap,
        registry: Arc<ClientRegistry>,
        forward: ForwardSettings,
        delivery_timeout: Duration,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            shards,
            registry,
            forwarder: Forwarder::new(forward)?,
            delivery_timeout,
            accepting: AtomicBool::new(true),
        })
    }

    /// Node that owns `uaid`.
    pub fn resolve(&self, uaid: &str) -> &NodeAddress {
        self.shards.resolve(uaid)
    }

    /// The shard map in use.
    pub fn shards(&self) -> &ShardMap {
        &self.shards
    }

    /// Where an update for `uaid` goes.
    ///
    /// A client connected to this node is served here even when the shard
    /// map assigns it to a peer.
    pub fn plan(&self, uaid: &str) -> RoutePlan {
        if self.registry.lookup(uaid).is_some() {
            return RoutePlan::Local;
        }
        let owner = self.resolve(uaid);
        if owner == self.shards.local() {
            RoutePlan::Local
        } else {
            RoutePlan::Remote(owner.clone())
        }
    }

    /// Deliver locally or forward to the owning node.
    pub async fn route(&self, update: &UpdateMessage) -> Result<RouteOutcome, RouteError> {
        if self.is_closed() {
            return Err(RouteError::Closed);
        }

        match self.plan(&update.uaid) {
            RoutePlan::Local => self.deliver_local(update).await,
            RoutePlan::Remote(owner) => self.forward(&owner, update).await,
        }
    }

    /// Forward to `owner`'s shard listener.
    pub async fn forward(
        &self,
        owner: &NodeAddress,
        update: &UpdateMessage,
    ) -> Result<RouteOutcome, RouteError> {
        self.forwarder.forward(owner, update).await?;
        log::debug!("[Router] Forwarded {} to {}", update, owner);
        Ok(RouteOutcome::Forwarded(owner.clone()))
    }

    /// Deliver to a connection on this node, never forwarding.
    pub async fn deliver_local(&self, update: &UpdateMessage) -> Result<RouteOutcome, RouteError> {
        let Some(connection) = self.registry.lookup(&update.uaid) else {
            log::debug!("[Router] {} not connected here, {} waits for re-sync", update.uaid, update);
            return Ok(RouteOutcome::NotConnected);
        };

        connection
            .notify(&update.chid, update.version, self.delivery_timeout)
            .await?;
        Ok(RouteOutcome::Delivered)
    }

    /// Whether the shard listener should still take forwarded updates.
    pub fn accepting_forwards(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Close peer connections and stop taking forwards.
    ///
    /// Idempotent: returns `true` only for the call that actually closed.
    pub fn close_all(&self) -> bool {
        let was_accepting = self.accepting.swap(false, Ordering::SeqCst);
        let pool_closed = self.forwarder.close();
        if was_accepting || pool_closed {
            log::info!("[Router] Closed; no longer forwarding or accepting forwards");
            true
        } else {
            false
        }
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        !self.accepting_forwards()
    }
}
