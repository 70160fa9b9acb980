use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use mesh_protocol::identity::{DeviceId, NodeId};

/// Address of one device endpoint: (owning node, device id).
pub type Endpoint = (NodeId, DeviceId);

/// A configured mapping from one device's output to another device's
/// input, possibly across nodes. Created and deleted by the control
/// plane; the router consults routes but never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub source: Endpoint,
    pub dest: Endpoint,
    pub enabled: bool,
    /// Tie-break when several routes match one source (higher wins)
    pub priority: i32,
    /// Insertion order, the final tie-break
    seq: u64,
}

/// Routes indexed by source endpoint. Each bucket is kept sorted by
/// (priority descending, insertion order ascending) so a match is a map
/// lookup plus a clone. Routes whose endpoints reference unknown devices
/// are legal — they simply never forward.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_source: BTreeMap<Endpoint, Vec<Route>>,
    next_seq: u64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, enabled, with the given priority. Re-adding an
    /// existing source→dest pair updates its priority in place (keeping
    /// its original position in insertion order) and re-enables it.
    pub fn add(&self, source: Endpoint, dest: Endpoint, priority: i32) {
        let mut inner = self.inner.write().unwrap();
        let seq = inner.next_seq;
        let bucket = inner.by_source.entry(source).or_default();

        let mut inserted = false;
        if let Some(existing) = bucket.iter_mut().find(|r| r.dest == dest) {
            existing.priority = priority;
            existing.enabled = true;
        } else {
            bucket.push(Route {
                source,
                dest,
                enabled: true,
                priority,
                seq,
            });
            inserted = true;
        }
        bucket.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        if inserted {
            inner.next_seq += 1;
        }
    }

    /// Remove a route. Idempotent; returns true if it existed.
    pub fn remove(&self, source: Endpoint, dest: Endpoint) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(bucket) = inner.by_source.get_mut(&source) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|r| r.dest != dest);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            inner.by_source.remove(&source);
        }
        removed
    }

    /// Enable or disable a route. Returns true if the route exists.
    pub fn set_enabled(&self, source: Endpoint, dest: Endpoint, enabled: bool) -> bool {
        let mut inner = self.inner.write().unwrap();
        if let Some(route) = inner
            .by_source
            .get_mut(&source)
            .and_then(|bucket| bucket.iter_mut().find(|r| r.dest == dest))
        {
            route.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Every enabled route matching `source`, highest priority first,
    /// insertion order as tie-break.
    pub fn matches(&self, source: Endpoint) -> Vec<Route> {
        self.inner
            .read()
            .unwrap()
            .by_source
            .get(&source)
            .map(|bucket| bucket.iter().filter(|r| r.enabled).cloned().collect())
            .unwrap_or_default()
    }

    /// All routes, for UI/API consumption.
    pub fn list(&self) -> Vec<Route> {
        self.inner
            .read()
            .unwrap()
            .by_source
            .values()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .by_source
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
