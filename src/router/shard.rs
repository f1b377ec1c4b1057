//! Shard assignment: which node owns a client.
//!
//! Every node is configured with the same node list, so every node computes
//! the same owner for a UAID without coordinating.

use sha2::{Digest, Sha256};

use crate::update::new_uaid;

/// Address (`host:port`) of a node's shard listener. Also its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Wrap a `host:port` string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The address as configured.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// Read-only mapping from UAID to owning node.
///
/// Nodes are kept sorted and de-duplicated so the configured order does not
/// matter. The local node is always a member.
#[derive(Debug, Clone)]
pub struct ShardMap {
    local: NodeAddress,
    nodes: Vec<NodeAddress>,
}

impl ShardMap {
    /// Build the map for `local` plus its peers.
    pub fn new(local: NodeAddress, peers: impl IntoIterator<Item = NodeAddress>) -> Self {
        let mut nodes: Vec<NodeAddress> = peers.into_iter().collect();
        nodes.push(local.clone());
        nodes.sort();
        nodes.dedup();
        Self { local, nodes }
    }

    /// A map with no peers: every client is local.
    pub fn single(local: NodeAddress) -> Self {
        Self::new(local, std::iter::empty())
    }

    /// Owner of `uaid`. Pure and deterministic.
    pub fn resolve(&self, uaid: &str) -> &NodeAddress {
        let digest = Sha256::digest(uaid.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let slot = u64::from_be_bytes(prefix) % self.nodes.len() as u64;
        &self.nodes[slot as usize]
    }

    /// Whether `uaid` is owned by this node.
    pub fn is_local(&self, uaid: &str) -> bool {
        self.resolve(uaid) == &self.local
    }

    /// A fresh UAID that resolves to this node.
    pub fn assign_uaid(&self) -> String {
        // The local node is a member, so roughly one draw in `nodes.len()` hits
        loop {
            let uaid = new_uaid();
            if self.is_local(&uaid) {
                return uaid;
            }
        }
    }

    /// This node.
    pub fn local(&self) -> &NodeAddress {
        &self.local
    }

    /// All nodes, sorted.
    pub fn nodes(&self) -> &[NodeAddress] {
        &self.nodes
    }
}
