use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::RwLock;

use crate::Peer;

/// A concurrency-safe registry of live peers, keyed by their socket addresses.
///
/// Lookups proceed concurrently with one another, while insertions and removals are exclusive;
/// the lock is fair, so a steady stream of readers can't starve a writer and vice versa.
#[derive(Default)]
pub struct RoutingTable(RwLock<HashMap<SocketAddr, Arc<Peer>>>);

impl RoutingTable {
    /// Registers a peer under its address; an existing entry for the same address is replaced.
    pub fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.0.write().insert(peer.addr(), peer.clone());
        peer
    }

    /// Removes the entry registered under the peer's address, returning it.
    pub fn remove(&self, peer: &Peer) -> Option<Arc<Peer>> {
        self.0.write().remove(&peer.addr())
    }

    /// Removes the entry under the peer's address only if it's this very peer, and not one that
    /// has replaced it since.
    pub(crate) fn evict(&self, peer: &Arc<Peer>) -> bool {
        let mut table = self.0.write();
        match table.get(&peer.addr()) {
            Some(registered) if Arc::ptr_eq(registered, peer) => {
                table.remove(&peer.addr());
                true
            }
            _ => false,
        }
    }

    /// Returns the peer registered under the given address.
    pub fn query(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.0.read().get(&addr).cloned()
    }

    /// Checks whether there is a peer registered under the given address.
    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.0.read().contains_key(&addr)
    }

    /// Returns the number of registered peers.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Checks whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Returns a point-in-time list of the registered peers, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.0.read().values().cloned().collect()
    }

    /// Returns a point-in-time list of the registered addresses, in no particular order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.0.read().keys().copied().collect()
    }
}
