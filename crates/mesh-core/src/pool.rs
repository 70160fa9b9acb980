use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use mesh_protocol::identity::NodeId;

use crate::connection::{ConnState, NetworkConnection};

/// Outcome of offering a connection to the pool.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored; no previous entry
    Added,
    /// Stored; a stale (non-connected) entry was closed and replaced
    Replaced,
    /// Rejected; a live connection to this peer already exists
    Rejected,
}

/// The set of live connections, indexed by peer node id.
///
/// Guarantees at most one live connection per peer: a second attempt
/// against a `Connected` entry is rejected; a stale entry (handshake
/// remnant, failed connection) is closed and replaced. The lock is held
/// only for map operations, never across I/O.
#[derive(Default)]
pub struct ConnectionPool {
    inner: RwLock<HashMap<NodeId, Arc<NetworkConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<NetworkConnection>) -> AddOutcome {
        let peer = conn.peer.id;
        let mut map = self.inner.write().unwrap();

        match map.get(&peer) {
            Some(existing) if existing.state() == ConnState::Connected => AddOutcome::Rejected,
            Some(existing) => {
                existing.close();
                debug!(peer = ?peer, "Replacing stale pool entry");
                map.insert(peer, conn);
                AddOutcome::Replaced
            }
            None => {
                map.insert(peer, conn);
                AddOutcome::Added
            }
        }
    }

    /// Remove a peer's connection. Idempotent; the caller decides whether
    /// to `close()` the returned connection.
    pub fn remove(&self, peer: NodeId) -> Option<Arc<NetworkConnection>> {
        self.inner.write().unwrap().remove(&peer)
    }

    pub fn get(&self, peer: NodeId) -> Option<Arc<NetworkConnection>> {
        self.inner.read().unwrap().get(&peer).cloned()
    }

    /// A peer with a `Connected` entry.
    pub fn get_connected(&self, peer: NodeId) -> Option<Arc<NetworkConnection>> {
        self.inner
            .read()
            .unwrap()
            .get(&peer)
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// The `Connected` peer sending from `addr` on the data plane.
    /// Sequence numbers are scoped to the sending connection — a relayed
    /// packet keeps its original source node id, so datagrams map to
    /// connections by sender address, not by the id inside the packet.
    pub fn get_connected_by_data_addr(
        &self,
        addr: std::net::SocketAddr,
    ) -> Option<Arc<NetworkConnection>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .find(|c| c.is_connected() && c.peer.data_addr == addr)
            .cloned()
    }

    /// Connections currently in `Connected` state.
    pub fn list_active(&self) -> Vec<Arc<NetworkConnection>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Arc<NetworkConnection>> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Node ids of all `Connected` peers.
    pub fn active_peers(&self) -> Vec<NodeId> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.peer.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use mesh_protocol::identity::NodeIdentity;

    fn conn(n: u8, state: ConnState) -> Arc<NetworkConnection> {
        let identity = NodeIdentity {
            id: NodeId::from_bytes([n; 16]),
            name: format!("node-{}", n),
            control_addr: "127.0.0.1:5005".parse().unwrap(),
            data_addr: "127.0.0.1:5004".parse().unwrap(),
        };
        let (c, _rx) = NetworkConnection::new(identity, ConnState::Connecting, &MeshConfig::default());
        if state == ConnState::Connected {
            c.transition(ConnState::Connected);
        }
        c
    }

    #[test]
    fn add_and_get() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.add(conn(1, ConnState::Connected)), AddOutcome::Added);
        assert!(pool.get(NodeId::from_bytes([1; 16])).is_some());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn second_live_connection_rejected() {
        let pool = ConnectionPool::new();
        pool.add(conn(1, ConnState::Connected));
        assert_eq!(pool.add(conn(1, ConnState::Connected)), AddOutcome::Rejected);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stale_entry_replaced_and_closed() {
        let pool = ConnectionPool::new();
        let stale = conn(1, ConnState::Connecting);
        pool.add(Arc::clone(&stale));

        assert_eq!(pool.add(conn(1, ConnState::Connected)), AddOutcome::Replaced);
        assert_eq!(stale.state(), ConnState::Disconnected);
        assert_eq!(pool.len(), 1);
        assert!(pool.get_connected(NodeId::from_bytes([1; 16])).is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let pool = ConnectionPool::new();
        pool.add(conn(1, ConnState::Connected));
        assert!(pool.remove(NodeId::from_bytes([1; 16])).is_some());
        assert!(pool.remove(NodeId::from_bytes([1; 16])).is_none());
        assert!(pool.remove(NodeId::from_bytes([9; 16])).is_none());
    }

    #[test]
    fn list_active_filters_state() {
        let pool = ConnectionPool::new();
        pool.add(conn(1, ConnState::Connected));
        pool.add(conn(2, ConnState::Connecting));
        pool.add(conn(3, ConnState::Connected));

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.list_active().len(), 2);
        assert_eq!(pool.active_peers().len(), 2);
        assert!(pool.get_connected(NodeId::from_bytes([2; 16])).is_none());
    }
}
