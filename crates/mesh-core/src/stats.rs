use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::connection::{ConnState, NetworkConnection};
use crate::registry::Device;
use crate::routing::Route;

/// Router-level counters, bumped on the forwarding path.
#[derive(Default)]
pub struct RouterCounters {
    /// Messages handed to a peer connection (direct or relay)
    pub forwarded: AtomicU64,
    /// Messages delivered to a local output port
    pub delivered_local: AtomicU64,
    /// Messages with no usable destination
    pub dropped: AtomicU64,
}

impl RouterCounters {
    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub delivered_local: u64,
    pub dropped: u64,
}

/// Point-in-time view of one connection, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Peer node id, lowercase hex
    pub peer: String,
    pub peer_name: String,
    pub state: String,
    /// Seconds connected, when the connection is live
    pub uptime_secs: Option<u64>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_dropped: u64,
    pub reorder_delivered: u64,
    pub reorder_duplicates: u64,
    pub reorder_evicted: u64,
    pub reorder_skipped: u64,
}

impl ConnectionStats {
    pub fn of(conn: &NetworkConnection) -> Self {
        let reorder = conn.reorder_stats();
        Self {
            peer: conn.peer.id.to_string(),
            peer_name: conn.peer.name.clone(),
            state: match conn.state() {
                ConnState::Disconnected => "disconnected",
                ConnState::Connecting => "connecting",
                ConnState::Connected => "connected",
                ConnState::Failed => "failed",
            }
            .to_string(),
            uptime_secs: conn.uptime().map(|d| d.as_secs()),
            packets_sent: conn.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: conn.counters.packets_received.load(Ordering::Relaxed),
            send_dropped: conn.counters.send_dropped.load(Ordering::Relaxed),
            reorder_delivered: reorder.delivered,
            reorder_duplicates: reorder.duplicates,
            reorder_evicted: reorder.evicted,
            reorder_skipped: reorder.skipped,
        }
    }
}

/// Full mesh snapshot: the control-plane query surface the API/CLI layer
/// consumes. JSON-serializable.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub node: String,
    pub node_name: String,
    pub connections: Vec<ConnectionStats>,
    pub devices: Vec<Device>,
    pub routes: Vec<Route>,
    pub router: RouterStats,
    /// Datagrams rejected by the codec since startup
    pub malformed_packets: u64,
}

impl MeshStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
