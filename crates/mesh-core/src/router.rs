use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use mesh_protocol::identity::{DeviceId, NodeId};
use mesh_protocol::packets::MidiPacket;
use mesh_protocol::now_us;

use crate::pool::ConnectionPool;
use crate::ports::OutputTable;
use crate::registry::DeviceRegistry;
use crate::routing::{Endpoint, RoutingTable};
use crate::stats::RouterCounters;
use crate::topology::LinkMap;

/// Central forwarding decision point.
///
/// Consumes MIDI tagged with its origin — a local input port or a
/// reassembled network packet — resolves routes, and delivers locally or
/// hands packets to peer connections. Lookups take short read locks;
/// no lock is ever held across a send.
pub struct MidiRouter {
    local: NodeId,
    routes: Arc<RoutingTable>,
    registry: Arc<DeviceRegistry>,
    pool: Arc<ConnectionPool>,
    links: Arc<LinkMap>,
    outputs: Arc<OutputTable>,
    pub counters: RouterCounters,
}

impl MidiRouter {
    pub fn new(
        local: NodeId,
        routes: Arc<RoutingTable>,
        registry: Arc<DeviceRegistry>,
        pool: Arc<ConnectionPool>,
        links: Arc<LinkMap>,
        outputs: Arc<OutputTable>,
    ) -> Self {
        Self {
            local,
            routes,
            registry,
            pool,
            links,
            outputs,
            counters: RouterCounters::default(),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// MIDI produced by a local input port. Resolves every enabled route
    /// matching the origin and dispatches each match independently.
    pub fn handle_local(&self, device: DeviceId, bytes: &[u8]) {
        let origin: Endpoint = (self.local, device);
        let matches = self.routes.matches(origin);
        if matches.is_empty() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(device = device, "No route for local MIDI, dropping");
            return;
        }

        for route in matches {
            self.dispatch(route.dest, bytes);
        }
    }

    /// A reassembled packet from the network, already addressed.
    ///
    /// Final hop: deliver straight to the destination device — the
    /// address survived end-to-end, so routes are not re-resolved here.
    /// Otherwise relay, but only to a *direct* neighbor; a packet for the
    /// local node is never forwarded back out, which is what keeps
    /// forwarding loop-free.
    pub fn handle_packet(&self, packet: MidiPacket) {
        if packet.dest_node == self.local {
            if self.outputs.deliver(packet.dest_device, &packet.payload) {
                self.counters.delivered_local.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        match self.pool.get_connected(packet.dest_node) {
            Some(conn) => {
                let dest = packet.dest_node;
                if conn.send(packet) {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    trace!(dest = ?dest, "Relayed packet to destination");
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                // Relay depth is one intermediate: a relayed packet whose
                // destination is not a direct neighbor has nowhere to go.
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    dest = ?packet.dest_node,
                    "Relay target not directly connected, dropping"
                );
            }
        }
    }

    /// Send one message toward a route destination.
    fn dispatch(&self, dest: Endpoint, bytes: &[u8]) {
        let (dest_node, dest_device) = dest;

        // A route whose destination the registry no longer knows is
        // dangling: non-forwarding, not an error.
        if !self.registry.contains(dest_node, dest_device) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(node = ?dest_node, device = dest_device, "Route destination unknown, dropping");
            return;
        }

        if dest_node == self.local {
            if self.outputs.deliver(dest_device, bytes) {
                self.counters.delivered_local.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let packet = MidiPacket {
            sequence: 0, // assigned by the connection on send
            source: self.local,
            dest_node,
            dest_device,
            timestamp_us: now_us(),
            payload: bytes.to_vec(),
        };
        self.forward(packet);
    }

    /// Pick the connection a remote-bound packet leaves on: the direct
    /// connection when one exists, otherwise a peer advertising the
    /// destination as its neighbor.
    fn forward(&self, packet: MidiPacket) {
        debug_assert_ne!(packet.dest_node, self.local);

        if let Some(conn) = self.pool.get_connected(packet.dest_node) {
            if conn.send(packet) {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if let Some(via) = self.links.via_for(packet.dest_node) {
            if let Some(conn) = self.pool.get_connected(via) {
                let dest = packet.dest_node;
                if conn.send(packet) {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    trace!(dest = ?dest, via = ?via, "Forwarded packet via intermediate");
                } else {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }

        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(dest = ?packet.dest_node, "Destination unreachable, dropping");
    }
}
