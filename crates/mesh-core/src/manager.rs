use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_protocol::identity::{NodeId, NodeIdentity};
use mesh_protocol::packets::{AdvertPacket, HelloPacket, NodeWire};
use mesh_protocol::PROTOCOL_VERSION;

use crate::connection::{run_sender, ConnState, NetworkConnection};
use crate::context::MeshContext;
use crate::pool::AddOutcome;

/// One peer as reported by the discovery feed. The transport producing
/// these (mDNS, static config, tests) is outside the core.
#[derive(Debug, Clone)]
pub struct NodeAnnouncement {
    pub id: NodeId,
    pub name: String,
    pub control_addr: SocketAddr,
    pub data_addr: SocketAddr,
    /// Devices the peer claims to expose; informational until handshake
    pub device_count: u16,
}

/// Discovery feed events consumed by the manager.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    NodeUp(NodeAnnouncement),
    NodeDown(NodeId),
}

/// Why a peer left the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    HeartbeatTimeout,
    DiscoveryLost,
    PeerBye,
    Shutdown,
}

/// Membership events surfaced to the surrounding application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    NodeConnected { node: NodeId, name: String },
    NodeDisconnected { node: NodeId, reason: DisconnectReason },
}

/// Mutating work funneled to the manager task so registry, link map, and
/// pool updates happen in one place.
#[derive(Debug)]
pub enum Command {
    InboundHello { hello: HelloPacket, src: SocketAddr },
    AdvertReceived { advert: AdvertPacket, src: SocketAddr },
    Teardown { node: NodeId, reason: DisconnectReason },
}

/// Manager task: consumes discovery events and internal commands, drives
/// connection creation and teardown. Holds no MIDI-forwarding logic.
pub async fn run(
    ctx: Arc<MeshContext>,
    mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    mut commands_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    info!(node = %ctx.identity.id, name = %ctx.identity.name, "Mesh manager started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = discovery_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    DiscoveryEvent::NodeUp(ann) => handle_node_up(&ctx, ann),
                    DiscoveryEvent::NodeDown(id) => {
                        teardown(&ctx, id, DisconnectReason::DiscoveryLost).await;
                    }
                }
            }

            command = commands_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::InboundHello { hello, src } => {
                        handle_inbound_hello(&ctx, hello, src).await;
                    }
                    Command::AdvertReceived { advert, src } => {
                        handle_advert(&ctx, advert, src).await;
                    }
                    Command::Teardown { node, reason } => {
                        teardown(&ctx, node, reason).await;
                    }
                }
            }
        }
    }

    debug!("Mesh manager stopped");
}

fn handle_node_up(ctx: &Arc<MeshContext>, ann: NodeAnnouncement) {
    if ann.id == ctx.local_id() {
        return; // our own announcement echoed back
    }
    if ctx.pool.get_connected(ann.id).is_some() {
        return;
    }
    if ctx.pending_hellos.lock().unwrap().contains_key(&ann.id) {
        return; // handshake already in flight
    }

    info!(
        peer = ?ann.id,
        name = %ann.name,
        devices = ann.device_count,
        control = %ann.control_addr,
        "Peer discovered, connecting"
    );

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move { connect_to(ctx, ann).await });
}

/// Outbound handshake: send HelloRequest with retransmission until a
/// response arrives or the handshake deadline passes.
async fn connect_to(ctx: Arc<MeshContext>, ann: NodeAnnouncement) {
    let peer = NodeIdentity {
        id: ann.id,
        name: ann.name.clone(),
        control_addr: ann.control_addr,
        data_addr: ann.data_addr,
    };
    let (conn, rx) = NetworkConnection::new(peer, ConnState::Connecting, &ctx.config);

    let (tx, mut response_rx) = oneshot::channel();
    {
        let mut pending = ctx.pending_hellos.lock().unwrap();
        if pending.contains_key(&ann.id) {
            return; // lost the race to another NodeUp
        }
        pending.insert(ann.id, tx);
    }

    let mut request = Vec::new();
    ctx.own_hello().encode_request(&mut request);

    let response = tokio::time::timeout(ctx.config.handshake_timeout(), async {
        loop {
            ctx.send_control(&request, ann.control_addr).await;
            tokio::select! {
                res = &mut response_rx => return res.ok(),
                _ = tokio::time::sleep(ctx.config.handshake_retry()) => continue,
            }
        }
    })
    .await
    .ok()
    .flatten();

    ctx.pending_hellos.lock().unwrap().remove(&ann.id);

    let Some(hello) = response else {
        warn!(peer = ?ann.id, "Handshake timed out");
        conn.transition(ConnState::Failed);
        conn.close();
        return;
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        warn!(
            peer = ?ann.id,
            peer_version = hello.protocol_version,
            our_version = PROTOCOL_VERSION,
            "Protocol version mismatch, abandoning handshake"
        );
        conn.transition(ConnState::Failed);
        conn.close();
        return;
    }

    // Discovery resolved the routable address; the hello fixes the data
    // port if the announcement had none.
    let data_addr = effective_data_addr(&hello.node, ann.data_addr.ip());
    let (conn, rx) = if data_addr == conn.peer.data_addr {
        (conn, rx)
    } else {
        conn.close();
        let corrected = NodeIdentity {
            id: ann.id,
            name: hello.node.name.clone(),
            control_addr: ann.control_addr,
            data_addr,
        };
        NetworkConnection::new(corrected, ConnState::Connecting, &ctx.config)
    };

    establish(&ctx, conn, rx, &hello).await;
}

/// A HelloRequest arrived on the control socket.
async fn handle_inbound_hello(ctx: &Arc<MeshContext>, hello: HelloPacket, src: SocketAddr) {
    if hello.protocol_version != PROTOCOL_VERSION {
        warn!(
            peer = ?hello.node.id,
            peer_version = hello.protocol_version,
            our_version = PROTOCOL_VERSION,
            "Dropping hello with mismatched protocol version"
        );
        return; // the initiator fails by timeout
    }
    if hello.node.id == ctx.local_id() {
        return;
    }

    // Re-sending the response is how a lost reply gets repaired; the
    // peer retransmits its request until one arrives.
    let mut response = Vec::new();
    ctx.own_hello().encode_response(&mut response);

    if ctx.pool.get_connected(hello.node.id).is_some() {
        ctx.send_control(&response, src).await;
        return;
    }

    let peer = NodeIdentity {
        id: hello.node.id,
        name: hello.node.name.clone(),
        control_addr: src,
        data_addr: effective_data_addr(&hello.node, src.ip()),
    };

    info!(peer = ?peer.id, name = %peer.name, from = %src, "Accepting inbound connection");

    let (conn, rx) = NetworkConnection::new(peer, ConnState::Connecting, &ctx.config);
    establish(ctx, conn, rx, &hello).await;
    ctx.send_control(&response, src).await;
}

/// Promote a handshaken connection into the pool and propagate the new
/// topology: the peer's devices and links are stored, other peers are
/// told about the newcomer, and our own advert is refreshed everywhere.
async fn establish(
    ctx: &Arc<MeshContext>,
    conn: Arc<NetworkConnection>,
    rx: mpsc::Receiver<mesh_protocol::packets::MidiPacket>,
    hello: &HelloPacket,
) -> bool {
    let peer_id = conn.peer.id;
    let peer_name = conn.peer.name.clone();

    conn.transition(ConnState::Connected);
    match ctx.pool.add(Arc::clone(&conn)) {
        AddOutcome::Rejected => {
            // Simultaneous connect: the other direction won
            debug!(peer = ?peer_id, "Connection already live, discarding duplicate");
            conn.close();
            return false;
        }
        AddOutcome::Added | AddOutcome::Replaced => {}
    }

    tokio::spawn(run_sender(
        Arc::clone(&conn),
        rx,
        Arc::clone(&ctx.data_socket),
    ));

    ctx.registry.replace_node(peer_id, &hello.devices);
    ctx.links.set_links(peer_id, &hello.links);

    info!(
        peer = ?peer_id,
        name = %peer_name,
        devices = hello.devices.len(),
        links = hello.links.len(),
        "Peer connected"
    );
    ctx.emit(MeshEvent::NodeConnected {
        node: peer_id,
        name: peer_name,
    });

    // Gossip, one hop: the newcomer's advert to everyone else, and our
    // refreshed neighbor set to everyone.
    let mut buf = Vec::new();
    AdvertPacket {
        node: peer_id,
        devices: hello.devices.clone(),
        links: hello.links.clone(),
    }
    .encode(&mut buf);
    ctx.broadcast_control(&buf, Some(peer_id)).await;

    ctx.own_advert().encode(&mut buf);
    ctx.broadcast_control(&buf, None).await;

    true
}

/// An advert arrived. First-hand adverts (sent by the node they describe)
/// update the link map and are relayed one hop; third-hand copies only
/// refresh the device registry — they are never re-relayed, which keeps
/// gossip loop-free.
async fn handle_advert(ctx: &Arc<MeshContext>, advert: AdvertPacket, src: SocketAddr) {
    if advert.node == ctx.local_id() {
        return;
    }

    let conn = ctx.pool.get(advert.node);
    let first_hand = conn
        .as_ref()
        .map(|c| c.peer.control_addr == src)
        .unwrap_or(false);

    // We hear about this node ourselves; a relayed copy (possibly stale,
    // possibly a withdrawal from someone else's teardown) cannot overrule
    // first-hand state.
    if conn.is_some() && !first_hand {
        return;
    }

    ctx.registry.replace_node(advert.node, &advert.devices);

    if first_hand {
        ctx.links.set_links(advert.node, &advert.links);

        let mut buf = Vec::new();
        advert.encode(&mut buf);
        ctx.broadcast_control(&buf, Some(advert.node)).await;
    }

    debug!(
        node = ?advert.node,
        devices = advert.devices.len(),
        first_hand = first_hand,
        "Applied topology advert"
    );
}

/// Remove a peer and everything that depended on it. Idempotent: a
/// second teardown (Bye racing a heartbeat timeout) is a silent no-op.
pub async fn teardown(ctx: &Arc<MeshContext>, node: NodeId, reason: DisconnectReason) {
    let conn = ctx.pool.remove(node);
    let removed_devices = ctx.registry.remove_node(node);
    ctx.links.remove(node);

    let Some(conn) = conn else {
        return;
    };
    conn.close();

    info!(
        peer = ?node,
        reason = ?reason,
        devices_removed = removed_devices,
        "Peer disconnected"
    );
    ctx.emit(MeshEvent::NodeDisconnected { node, reason });

    // Withdraw the peer from everyone we still talk to
    let mut buf = Vec::new();
    AdvertPacket {
        node,
        devices: vec![],
        links: vec![],
    }
    .encode(&mut buf);
    ctx.broadcast_control(&buf, None).await;

    ctx.own_advert().encode(&mut buf);
    ctx.broadcast_control(&buf, None).await;
}

/// The data address a peer should actually be reached at: the advertised
/// one, unless it is unspecified (bound to 0.0.0.0) — then the address
/// the datagram came from, with the advertised port.
fn effective_data_addr(wire: &NodeWire, fallback_ip: IpAddr) -> SocketAddr {
    if wire.data_addr.ip().is_unspecified() {
        SocketAddr::new(fallback_ip, wire.data_addr.port())
    } else {
        SocketAddr::V4(wire.data_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_data_addr_prefers_advertised() {
        let wire = NodeWire {
            id: NodeId::from_bytes([1; 16]),
            name: "n".to_string(),
            data_addr: "192.168.1.5:5004".parse().unwrap(),
        };
        let addr = effective_data_addr(&wire, "10.0.0.9".parse().unwrap());
        assert_eq!(addr, "192.168.1.5:5004".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn effective_data_addr_falls_back_to_source_ip() {
        let wire = NodeWire {
            id: NodeId::from_bytes([1; 16]),
            name: "n".to_string(),
            data_addr: "0.0.0.0:5004".parse().unwrap(),
        };
        let addr = effective_data_addr(&wire, "10.0.0.9".parse().unwrap());
        assert_eq!(addr, "10.0.0.9:5004".parse::<SocketAddr>().unwrap());
    }
}
