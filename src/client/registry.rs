//! Client registry enforcing one live connection per UAID.
//!
//! The registry is shared by every push session, the router and the update
//! worker. It only exposes atomic operations; the backing map never leaves
//! this module and no map guard is held across an await.

use dashmap::DashMap;

use super::ConnectionHandle;

/// Registry of live client connections keyed by UAID.
///
/// # Single-connection invariant
///
/// [`register`](Self::register) replaces any existing entry in one atomic
/// map operation and hands the previous handle back. The caller evicts it,
/// so two transports never both believe they are canonical for a client.
///
/// ```text
/// register(B) ──► clients["u1"] = B ──► returns Some(A) ──► A.evict()
/// ```
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ConnectionHandle>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced (if any).
    ///
    /// The returned handle must be closed by the caller.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let uaid = handle.uaid().to_string();
        self.clients.insert(uaid, handle)
    }

    /// Remove whatever connection is registered for `uaid`.
    pub fn unregister(&self, uaid: &str) -> Option<ConnectionHandle> {
        self.clients.remove(uaid).map(|(_, handle)| handle)
    }

    /// Remove the entry for `uaid` only if it still belongs to `conn_id`.
    ///
    /// A session that was evicted by a reconnect calls this on its way out;
    /// it must not remove the connection that replaced it.
    pub fn unregister_connection(&self, uaid: &str, conn_id: u64) -> bool {
        self.clients
            .remove_if(uaid, |_, handle| handle.conn_id() == conn_id)
            .is_some()
    }

    /// Look up the live connection for `uaid`.
    pub fn lookup(&self, uaid: &str) -> Option<ConnectionHandle> {
        self.clients.get(uaid).map(|entry| entry.value().clone())
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Evict and remove every connection (used on shutdown).
    ///
    /// Returns the number of connections evicted.
    pub fn evict_all(&self) -> usize {
        let uaids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let mut evicted = 0;
        for uaid in uaids {
            if let Some(handle) = self.unregister(&uaid) {
                handle.evict();
                evicted += 1;
            }
        }
        evicted
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("client_count", &self.clients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn handle(uaid: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(uaid.to_string(), HashMap::new(), tx), rx)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ClientRegistry::new();
        let (conn, _rx) = handle("u1");
        assert!(registry.register(conn.clone()).is_none());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("u1").unwrap().conn_id(), conn.conn_id());
        assert!(registry.lookup("u2").is_none());
    }

    #[test]
    fn test_second_registration_returns_first() {
        let registry = ClientRegistry::new();
        let (a, _ra) = handle("u1");
        let (b, _rb) = handle("u1");

        registry.register(a.clone());
        let evicted = registry.register(b.clone()).expect("A should be returned");

        assert_eq!(evicted.conn_id(), a.conn_id());
        assert_eq!(registry.lookup("u1").unwrap().conn_id(), b.conn_id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_connection_cannot_unregister_successor() {
        let registry = ClientRegistry::new();
        let (a, _ra) = handle("u1");
        let (b, _rb) = handle("u1");
        registry.register(a.clone());
        registry.register(b.clone());

        assert!(!registry.unregister_connection("u1", a.conn_id()));
        assert_eq!(registry.lookup("u1").unwrap().conn_id(), b.conn_id());

        assert!(registry.unregister_connection("u1", b.conn_id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister() {
        let registry = ClientRegistry::new();
        let (a, _ra) = handle("u1");
        registry.register(a);
        assert!(registry.unregister("u1").is_some());
        assert!(registry.unregister("u1").is_none());
        assert!(registry.lookup("u1").is_none());
    }

    #[test]
    fn test_evict_all() {
        let registry = ClientRegistry::new();
        let (a, _ra) = handle("u1");
        let (b, _rb) = handle("u2");
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.evict_all(), 2);
        assert!(registry.is_empty());
        assert!(a.is_evicted());
        assert!(b.is_evicted());
    }

    #[test]
    fn test_concurrent_registration_leaves_one_winner() {
        let registry = Arc::new(ClientRegistry::new());
        let mut threads = Vec::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..16 {
            let (conn, rx) = handle("u1");
            receivers.push(rx);
            ids.push(conn.conn_id());
            let registry = Arc::clone(&registry);
            threads.push(std::thread::spawn(move || registry.register(conn)));
        }

        let evicted: Vec<u64> = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .map(|h| h.conn_id())
            .collect();

        // Every registration but the surviving one was handed back exactly once
        assert_eq!(evicted.len(), 15);
        let winner = registry.lookup("u1").unwrap().conn_id();
        assert!(!evicted.contains(&winner));
        assert!(ids.contains(&winner));
    }
}
