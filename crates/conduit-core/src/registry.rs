//! Endpoint to live connection map for multiplexing servers.
//!
//! One listening connector serves many remotes. The registry lets an
//! outbound send find the live connection for its destination. Entries are
//! added when a remote is accepted and removed when its transport closes;
//! a send to an endpoint without an entry fails locally.

use crate::endpoint::Endpoint;
use crate::error::RegistryError;
use dashmap::DashMap;
use tracing::trace;

/// Concurrent `Endpoint -> H` map.
///
/// Sharded, so inserts and removals for different endpoints do not contend
/// on a single lock, and a lookup never sees a half-inserted entry.
#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    connections: DashMap<Endpoint, H>,
}

impl<H: Clone> ConnectionRegistry<H> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Record a newly accepted connection, returning any entry it replaced.
    pub fn register(&self, endpoint: Endpoint, handle: H) -> Option<H> {
        trace!("Registering connection {}", endpoint);
        self.connections.insert(endpoint, handle)
    }

    /// Forget the connection for `endpoint`.
    pub fn unregister(&self, endpoint: &Endpoint) -> Option<H> {
        trace!("Unregistering connection {}", endpoint);
        self.connections.remove(endpoint).map(|(_, handle)| handle)
    }

    /// Forget the connection for `endpoint` only if `predicate` holds for it.
    ///
    /// A peer that reconnects from the same endpoint replaces the old entry
    /// before the old connection reports its close; checking identity here
    /// keeps that close from evicting the new connection.
    pub fn unregister_if(
        &self,
        endpoint: &Endpoint,
        predicate: impl FnOnce(&H) -> bool,
    ) -> Option<H> {
        self.connections
            .remove_if(endpoint, |_, handle| predicate(handle))
            .map(|(_, handle)| handle)
    }

    /// Connection for `endpoint`, if live.
    pub fn get(&self, endpoint: &Endpoint) -> Option<H> {
        self.connections.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Connection for `endpoint`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownConnection`] if no live connection is
    /// registered.
    pub fn lookup(&self, endpoint: &Endpoint) -> Result<H, RegistryError> {
        self.get(endpoint)
            .ok_or_else(|| RegistryError::UnknownConnection(endpoint.clone()))
    }

    /// Whether `endpoint` has a live connection
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.connections.contains_key(endpoint)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the connected endpoints, in no particular order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove every entry, returning the handles.
    pub fn drain(&self) -> Vec<H> {
        let endpoints = self.endpoints();
        endpoints
            .iter()
            .filter_map(|endpoint| self.unregister(endpoint))
            .collect()
    }
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("192.168.1.10", port)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        registry.register(ep(1000), 1u64);
        registry.register(ep(1001), 2u64);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(&ep(1000)), Ok(1));
        assert!(registry.contains(&ep(1001)));
    }

    #[test]
    fn test_unknown_connection() {
        let registry: ConnectionRegistry<u64> = ConnectionRegistry::new();
        assert_eq!(
            registry.lookup(&ep(2000)),
            Err(RegistryError::UnknownConnection(ep(2000)))
        );

        registry.register(ep(2000), 7);
        registry.unregister(&ep(2000));
        assert_eq!(
            registry.lookup(&ep(2000)),
            Err(RegistryError::UnknownConnection(ep(2000)))
        );
    }

    #[test]
    fn test_unregister_if_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        registry.register(ep(3000), 1u64);
        // Same peer reconnects before the first connection's close arrives
        registry.register(ep(3000), 2u64);

        assert_eq!(registry.unregister_if(&ep(3000), |id| *id == 1), None);
        assert_eq!(registry.lookup(&ep(3000)), Ok(2));
        assert_eq!(registry.unregister_if(&ep(3000), |id| *id == 2), Some(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain() {
        let registry = ConnectionRegistry::new();
        for port in 0..10 {
            registry.register(ep(port), port);
        }
        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_distinct_endpoints() {
        let registry = Arc::new(ConnectionRegistry::new());
        let threads: Vec<_> = (0..8u16)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100u16 {
                        let endpoint = ep(t * 1000 + i);
                        registry.register(endpoint.clone(), u64::from(i));
                        if i % 2 == 1 {
                            registry.unregister(&endpoint);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }
}
