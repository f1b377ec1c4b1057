//! Channel version storage contract.
//!
//! The relay never talks to a storage engine directly. It consumes a narrow
//! contract: derive a stable primary key for a `(uaid, chid)` pair, read the
//! stored version, and atomically apply a version only if it is newer.
//!
//! ```text
//! Dispatcher ──apply_if_newer(key, v)──► ChannelStore
//!            ◄──── applied: bool ───────
//! ```
//!
//! `applied == false` is not an error: it means the update was stale or a
//! duplicate, and the caller must not notify the client.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::update::{validate_chid, validate_uaid, IdError, Version};

pub use memory::MemoryStore;

/// Storage failure surfaced to the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backing store rejected or failed the operation.
    #[error("store operation failed: {0}")]
    Failed(String),
}

/// Primary key of one channel record.
///
/// Deterministic in `(uaid, chid)` and stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate the primary key for a channel.
///
/// Both identifiers are validated; neither may contain the `.` separator, so
/// distinct pairs never collide.
pub fn primary_key(uaid: &str, chid: &str) -> Result<ChannelKey, IdError> {
    validate_uaid(uaid)?;
    validate_chid(chid)?;
    Ok(ChannelKey(format!("{uaid}.{chid}")))
}

/// Key/version store consumed by the relay core.
#[async_trait]
pub trait ChannelStore: Send + Sync + std::fmt::Debug {
    /// Current stored version, or `None` if the channel was never updated.
    async fn get(&self, key: &ChannelKey) -> Result<Option<Version>, StoreError>;

    /// Store `version` if it is strictly newer than the stored one.
    ///
    /// Returns `Ok(true)` if the version was applied, `Ok(false)` if it was
    /// stale or a duplicate.
    async fn apply_if_newer(&self, key: &ChannelKey, version: Version) -> Result<bool, StoreError>;

    /// Whether the store is reachable, for deep health checks.
    async fn healthy(&self) -> bool;
}
