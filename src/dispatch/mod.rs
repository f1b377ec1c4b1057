//! Update dispatch: persist first, then route.
//!
//! Every version bump, whether it came in over REST on this node or was
//! forwarded by a peer, goes through [`Dispatcher::dispatch`]. Storage is the
//! source of truth; delivery is best-effort and a client that misses a
//! notification catches up from storage on its next handshake.
//!
//! # Modules
//!
//! - [`queue`] - bounded update queue and its single consumer task

pub mod queue;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::router::{NodeAddress, RouteOutcome, RoutePlan, Router};
use crate::storage::{primary_key, ChannelStore, StoreError};
use crate::update::{IdError, Origin, UpdateMessage};

pub use queue::{EnqueueError, UpdateJob, UpdateQueue, UpdateWorker};

/// Why an update was not persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The UAID or CHID is not a valid identifier.
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] IdError),
    /// The channel store failed; the update is dropped.
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    /// The relay is shutting down.
    #[error("relay unavailable")]
    Unavailable,
}

/// What happened to a persisted update's notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "delivery", content = "node")]
pub enum Delivery {
    /// Nothing to deliver (stale or duplicate version).
    Skipped,
    /// Written to a connection on this node.
    Delivered,
    /// Owned here, but the client is offline.
    NotConnected,
    /// Handed to the owning peer.
    Forwarded(String),
    /// Routing failed after persistence.
    Failed,
}

impl Delivery {
    /// Short name used in REST responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Skipped => "skipped",
            Delivery::Delivered => "delivered",
            Delivery::NotConnected => "not_connected",
            Delivery::Forwarded(_) => "forwarded",
            Delivery::Failed => "failed",
        }
    }
}

impl From<RouteOutcome> for Delivery {
    fn from(outcome: RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Delivered => Delivery::Delivered,
            RouteOutcome::NotConnected => Delivery::NotConnected,
            RouteOutcome::Forwarded(node) => Delivery::Forwarded(node.to_string()),
        }
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Whether the version was newer than the stored one.
    pub applied: bool,
    /// Notification result.
    pub delivery: Delivery,
}

impl DispatchOutcome {
    fn stale() -> Self {
        Self {
            applied: false,
            delivery: Delivery::Skipped,
        }
    }
}

/// A persisted update that still has to be forwarded to its owner.
#[derive(Debug)]
pub struct PendingForward {
    update: UpdateMessage,
    node: NodeAddress,
}

impl PendingForward {
    /// The persisted update.
    pub fn update(&self) -> &UpdateMessage {
        &self.update
    }

    /// Owning node.
    pub fn node(&self) -> &NodeAddress {
        &self.node
    }
}

/// Result of [`Dispatcher::dispatch_local`].
#[derive(Debug)]
pub enum Dispatched {
    /// Nothing left to do.
    Done(DispatchOutcome),
    /// Persisted; delivery waits on a peer forward.
    Forward(PendingForward),
}

/// Orchestrates persist → route for one update at a time.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<dyn ChannelStore>,
    router: Arc<Router>,
}

impl Dispatcher {
    /// Create a dispatcher over a store and router.
    pub fn new(store: Arc<dyn ChannelStore>, router: Arc<Router>) -> Self {
        Self { store, router }
    }

    /// Persist `update` if it is newer than the stored version, then deliver it.
    pub async fn dispatch(&self, update: &UpdateMessage) -> Result<DispatchOutcome, DispatchError> {
        match self.dispatch_local(update).await? {
            Dispatched::Done(outcome) => Ok(outcome),
            Dispatched::Forward(pending) => Ok(self.complete(pending).await),
        }
    }

    /// Persist and deliver on this node, stopping short of a peer forward.
    ///
    /// A persisted update owned by a peer comes back as
    /// [`Dispatched::Forward`]; finish it with [`complete`](Self::complete).
    pub async fn dispatch_local(&self, update: &UpdateMessage) -> Result<Dispatched, DispatchError> {
        let key = primary_key(&update.uaid, &update.chid)?;

        let applied = self.store.apply_if_newer(&key, update.version).await.map_err(|e| {
            log::error!("[Dispatch] Dropping {}: {}", update, e);
            DispatchError::Storage(e)
        })?;

        if !applied {
            if update.origin == Origin::Peer && self.already_persisted_by_peer(update).await? {
                // Shared store: the origin node wrote this exact version, we only deliver
                let delivery = self.deliver_here(update).await;
                return Ok(Dispatched::Done(DispatchOutcome {
                    applied: false,
                    delivery,
                }));
            }
            log::debug!("[Dispatch] Stale or duplicate {}", update);
            return Ok(Dispatched::Done(DispatchOutcome::stale()));
        }

        let delivery = match update.origin {
            Origin::Local if self.router.is_closed() => {
                log::warn!("[Dispatch] Delivery of {} dropped: router closed", update);
                Delivery::Failed
            }
            Origin::Local => match self.router.plan(&update.uaid) {
                RoutePlan::Local => self.deliver_here(update).await,
                RoutePlan::Remote(node) => {
                    return Ok(Dispatched::Forward(PendingForward {
                        update: update.clone(),
                        node,
                    }));
                }
            },
            Origin::Peer => self.deliver_here(update).await,
        };

        log::debug!("[Dispatch] {} -> {}", update, delivery.as_str());
        Ok(Dispatched::Done(DispatchOutcome {
            applied: true,
            delivery,
        }))
    }

    /// Forward a persisted update to its owner.
    pub async fn complete(&self, pending: PendingForward) -> DispatchOutcome {
        let PendingForward { update, node } = pending;
        let delivery = match self.router.forward(&node, &update).await {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                log::warn!("[Dispatch] Delivery of {} dropped: {}", update, e);
                Delivery::Failed
            }
        };
        log::debug!("[Dispatch] {} -> {}", update, delivery.as_str());
        DispatchOutcome {
            applied: true,
            delivery,
        }
    }

    async fn already_persisted_by_peer(&self, update: &UpdateMessage) -> Result<bool, DispatchError> {
        let key = primary_key(&update.uaid, &update.chid)?;
        let stored = self.store.get(&key).await?;
        Ok(stored == Some(update.version))
    }

    async fn deliver_here(&self, update: &UpdateMessage) -> Delivery {
        match self.router.deliver_local(update).await {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                log::warn!("[Dispatch] Delivery of {} dropped: {}", update, e);
                Delivery::Failed
            }
        }
    }

    /// The router this dispatcher routes through.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}
