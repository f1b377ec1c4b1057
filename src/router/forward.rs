//! Outbound forwarding of updates to the node that owns the client.
//!
//! Forwards are fire-and-forget HTTP POSTs to the peer's shard listener with
//! an explicit per-attempt timeout and a small fixed retry budget. Nothing is
//! queued durably: once the budget is spent the update is dropped and the
//! client catches up from storage on its next handshake.

// Rust guideline compliant 2026-02

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use reqwest::Client;

use super::shard::NodeAddress;
use super::RouteError;
use crate::constants::{
    DEFAULT_FORWARD_ATTEMPTS, DEFAULT_FORWARD_RETRY_DELAY, DEFAULT_FORWARD_TIMEOUT,
};
use crate::update::{ForwardBody, UpdateMessage};

/// Forwarding knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSettings {
    /// Timeout of one attempt.
    pub timeout: Duration,
    /// Total attempts (at least 1).
    pub attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FORWARD_TIMEOUT,
            attempts: DEFAULT_FORWARD_ATTEMPTS,
            retry_delay: DEFAULT_FORWARD_RETRY_DELAY,
        }
    }
}

/// HTTP client for peer shard listeners.
///
/// The pooled client is dropped by [`close`](Self::close), which tears down
/// every keep-alive connection to peers.
#[derive(Debug)]
pub struct Forwarder {
    client: RwLock<Option<Client>>,
    settings: ForwardSettings,
}

impl Forwarder {
    /// Build a forwarder with its own connection pool.
    pub fn new(settings: ForwardSettings) -> Result<Self, RouteError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .user_agent(crate::constants::user_agent())
            .build()
            .map_err(|e| RouteError::Client(e.to_string()))?;

        Ok(Self {
            client: RwLock::new(Some(client)),
            settings,
        })
    }

    /// Forward settings in effect.
    pub fn settings(&self) -> ForwardSettings {
        self.settings
    }

    /// Forward `update` to `node`, retrying up to the configured budget.
    pub async fn forward(&self, node: &NodeAddress, update: &UpdateMessage) -> Result<(), RouteError> {
        let url = format!("http://{}/route/{}", node, update.uaid);
        let body = ForwardBody::from_update(update);
        let attempts = self.settings.attempts.max(1);

        let mut last_error = RouteError::Closed;
        for attempt in 1..=attempts {
            // Clone out of the lock; never hold it across the request
            let Some(client) = self.current_client() else {
                return Err(RouteError::Closed);
            };

            match Self::attempt(&client, &url, &body, node).await {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("[Router] Forwarded {} to {} on attempt {}", update, node, attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::debug!(
                        "[Router] Forward of {} to {} failed (attempt {}/{}): {}",
                        update,
                        node,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        Err(last_error)
    }

    async fn attempt(
        client: &Client,
        url: &str,
        body: &ForwardBody,
        node: &NodeAddress,
    ) -> Result<(), RouteError> {
        match client.post(url).json(body).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(RouteError::Rejected {
                node: node.clone(),
                status: response.status().as_u16(),
            }),
            Err(e) if e.is_timeout() => Err(RouteError::Timeout { node: node.clone() }),
            Err(e) => Err(RouteError::Unreachable {
                node: node.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn current_client(&self) -> Option<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the connection pool. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.current_client().is_none()
    }
}
