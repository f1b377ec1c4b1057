//! In-process channel store.
//!
//! Backs a single node (or several nodes in one test process sharing an
//! `Arc<MemoryStore>`). The compare-and-swap happens under the `DashMap`
//! shard lock for the key, so concurrent `apply_if_newer` calls for the same
//! channel are linearized.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ChannelKey, ChannelStore, StoreError};
use crate::update::Version;

/// `DashMap`-backed [`ChannelStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    versions: DashMap<ChannelKey, Version>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channel records.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn get(&self, key: &ChannelKey) -> Result<Option<Version>, StoreError> {
        Ok(self.versions.get(key).map(|v| *v))
    }

    async fn apply_if_newer(&self, key: &ChannelKey, version: Version) -> Result<bool, StoreError> {
        match self.versions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if version > *entry.get() {
                    entry.insert(version);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(version);
                Ok(true)
            }
        }
    }

    async fn healthy(&self) -> bool {
        true
    }
}
