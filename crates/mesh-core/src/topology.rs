use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use mesh_protocol::identity::NodeId;

/// Each directly-connected peer's advertised neighbor set.
///
/// Peers re-advertise whenever their own connection set changes, so this
/// map is the relay-selection view: a destination that is not directly
/// connected is reachable when some direct peer lists it as a neighbor.
/// Relay depth is bounded at one intermediate — an intermediate only
/// forwards to its own direct neighbors, which (with the final-hop rule)
/// makes forwarding loops impossible.
#[derive(Default)]
pub struct LinkMap {
    inner: RwLock<BTreeMap<NodeId, BTreeSet<NodeId>>>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a peer's advertised neighbor set.
    pub fn set_links(&self, peer: NodeId, links: &[NodeId]) {
        let set: BTreeSet<NodeId> = links.iter().copied().collect();
        self.inner.write().unwrap().insert(peer, set);
    }

    /// Forget a peer entirely (disconnected).
    pub fn remove(&self, peer: NodeId) {
        self.inner.write().unwrap().remove(&peer);
    }

    /// The first direct peer that advertises `dest` as a neighbor.
    /// Deterministic (lowest peer id wins) so repeated sends take a
    /// stable path.
    pub fn via_for(&self, dest: NodeId) -> Option<NodeId> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|(_, links)| links.contains(&dest))
            .map(|(peer, _)| *peer)
    }

    pub fn neighbors_of(&self, peer: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .unwrap()
            .get(&peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
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

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    #[test]
    fn via_for_finds_advertising_peer() {
        let links = LinkMap::new();
        links.set_links(node(2), &[node(1), node(3)]);

        assert_eq!(links.via_for(node(3)), Some(node(2)));
        assert_eq!(links.via_for(node(9)), None);
    }

    #[test]
    fn via_for_is_deterministic() {
        let links = LinkMap::new();
        links.set_links(node(5), &[node(9)]);
        links.set_links(node(2), &[node(9)]);

        // Lowest peer id advertising the destination wins
        assert_eq!(links.via_for(node(9)), Some(node(2)));
    }

    #[test]
    fn remove_forgets_peer() {
        let links = LinkMap::new();
        links.set_links(node(2), &[node(3)]);
        links.remove(node(2));
        assert_eq!(links.via_for(node(3)), None);
    }

    #[test]
    fn set_links_replaces() {
        let links = LinkMap::new();
        links.set_links(node(2), &[node(3)]);
        links.set_links(node(2), &[node(4)]);
        assert_eq!(links.via_for(node(3)), None);
        assert_eq!(links.via_for(node(4)), Some(node(2)));
    }
}
