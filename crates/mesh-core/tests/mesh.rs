//! Integration tests: real mesh nodes over loopback UDP.
//!
//! Each test starts nodes on ephemeral ports, feeds the discovery channel
//! by hand, and observes delivery through channel-backed output ports.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use mesh_core::config::MeshConfig;
use mesh_core::manager::{DisconnectReason, DiscoveryEvent, MeshEvent, NodeAnnouncement};
use mesh_core::node::{MeshNode, MeshNodeHandle};
use mesh_core::ports::OutputPort;

use mesh_protocol::identity::{DeviceDesc, NodeId, PortDirection};
use mesh_protocol::packets::{ControlPacket, HelloPacket, NodeWire};
use mesh_protocol::PROTOCOL_VERSION;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Output port that forwards everything into a channel the test can
/// await on.
struct ChannelPort {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelPort {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl OutputPort for ChannelPort {
    fn send(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| anyhow::anyhow!("test channel closed"))
    }
}

fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.network.bind_addr = "127.0.0.1".to_string();
    config.network.data_port = 0;
    config.network.control_port = 0;
    // Fast liveness so eviction tests finish quickly
    config.mesh.heartbeat_interval_ms = 100;
    config.mesh.handshake_timeout_ms = 2000;
    config.mesh.handshake_retry_ms = 100;
    config.buffer.reorder_skip_ms = 300;
    config
}

async fn start_node(name: &str) -> MeshNodeHandle {
    MeshNode::start(test_config(), name)
        .await
        .expect("node should start")
}

fn announcement(handle: &MeshNodeHandle) -> NodeAnnouncement {
    let identity = handle.identity();
    NodeAnnouncement {
        id: identity.id,
        name: identity.name.clone(),
        control_addr: identity.control_addr,
        data_addr: identity.data_addr,
        device_count: 0,
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Announce `b` to `a` and wait until the connection is live both ways.
async fn link(a: &MeshNodeHandle, b: &MeshNodeHandle) {
    a.discovery()
        .send(DiscoveryEvent::NodeUp(announcement(b)))
        .await
        .expect("discovery channel open");

    let (a_id, b_id) = (a.local_id(), b.local_id());
    wait_until("nodes to connect", || {
        a.reachable(b_id) && b.reachable(a_id)
    })
    .await;
}

async fn recv_timeout(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, what: &str) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("channel open")
}

// ---------------------------------------------------------------------------
// 1. End-to-end: direct route between two nodes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_direct_route() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;

    let input = a.register_input(1, "A In");
    let (port, mut received) = ChannelPort::new();
    b.register_output(2, "B Out", port);

    link(&a, &b).await;

    // The handshake advertised B's output to A
    let b_id = b.local_id();
    wait_until("remote device in registry", || {
        a.registry().contains(b_id, 2)
    })
    .await;

    a.routes().add((a.local_id(), 1), (b.local_id(), 2), 0);

    input.feed(&[0x90, 0x3C, 0x64]); // Note On, middle C, velocity 100

    let bytes = recv_timeout(&mut received, "delivery at B").await;
    assert_eq!(bytes, vec![0x90, 0x3C, 0x64]);

    wait_until("forwarded counter", || a.status().router.forwarded == 1).await;

    a.shutdown().await;
    b.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Multi-hop: A -> B -> C chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn multi_hop_chain_relays_through_intermediate() {
    let a = start_node("chain-a").await;
    let b = start_node("chain-b").await;
    let c = start_node("chain-c").await;

    let input = a.register_input(1, "A In");

    // B has its own local output that must stay silent
    let (b_port, mut b_received) = ChannelPort::new();
    b.register_output(9, "B Local Out", b_port);

    let (c_port, mut c_received) = ChannelPort::new();
    c.register_output(2, "C Out", c_port);

    link(&a, &b).await;
    link(&b, &c).await;

    // Gossip gives A both C's device and a relay path through B
    let c_id = c.local_id();
    wait_until("C reachable from A", || a.reachable(c_id)).await;
    wait_until("C's device known at A", || a.registry().contains(c_id, 2)).await;

    a.routes().add((a.local_id(), 1), (c.local_id(), 2), 0);

    input.feed(&[0x90, 0x3C, 0x64]);

    let bytes = recv_timeout(&mut c_received, "delivery at C").await;
    assert_eq!(bytes, vec![0x90, 0x3C, 0x64]);

    // B relayed (its forwarded counter moved) but delivered nothing locally
    wait_until("B's relay counter", || b.status().router.forwarded >= 1).await;
    assert!(b_received.try_recv().is_err());
    assert_eq!(b.status().router.delivered_local, 0);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Unreachable destination: counted drop, no failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_destination_counts_drop() {
    let a = start_node("lonely").await;
    let input = a.register_input(1, "In");

    // Route to a node that was never connected
    let ghost = NodeId::generate();
    a.routes().add((a.local_id(), 1), (ghost, 2), 0);

    input.feed(&[0xB0, 0x07, 0x64]);

    wait_until("dropped counter", || a.status().router.dropped >= 1).await;
    assert_eq!(a.status().router.forwarded, 0);

    a.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Heartbeat eviction: a silent peer is removed and purged
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_peer_evicted_by_heartbeat_timeout() {
    let a = start_node("survivor").await;
    let mut events = a.events();

    // A hand-rolled peer that handshakes but never heartbeats
    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_id = NodeId::generate();
    let hello = HelloPacket {
        protocol_version: PROTOCOL_VERSION,
        node: NodeWire {
            id: fake_id,
            name: "zombie".to_string(),
            data_addr: "127.0.0.1:9".parse().unwrap(),
        },
        devices: vec![DeviceDesc {
            id: 5,
            direction: PortDirection::Output,
            name: "Ghost Out".to_string(),
        }],
        links: vec![],
    };
    let mut buf = Vec::new();
    hello.encode_request(&mut buf);
    control
        .send_to(&buf, a.identity().control_addr)
        .await
        .unwrap();

    // Handshake completes (adverts and heartbeats may interleave)
    let mut recv_buf = [0u8; 1500];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (len, _) = control.recv_from(&mut recv_buf).await.unwrap();
            if matches!(
                ControlPacket::decode(&recv_buf[..len]),
                Ok(ControlPacket::HelloResponse(_))
            ) {
                break;
            }
        }
    })
    .await
    .expect("hello response expected");
    wait_until("fake peer connected", || a.reachable(fake_id)).await;
    wait_until("fake peer's device", || a.registry().contains(fake_id, 5)).await;

    // ...then the peer goes silent. Three missed 100ms intervals later it
    // must be evicted and its devices purged.
    let event = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(MeshEvent::NodeDisconnected { node, reason }) if node == fake_id => {
                    return reason;
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("eviction event expected");

    assert_eq!(event, DisconnectReason::HeartbeatTimeout);
    assert!(!a.reachable(fake_id));
    assert!(!a.registry().contains(fake_id, 5));

    a.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Goodbye: explicit shutdown tears the peer down immediately
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_sends_goodbye() {
    let a = start_node("stayer").await;
    let b = start_node("leaver").await;
    let mut events = a.events();

    link(&a, &b).await;
    let b_id = b.local_id();

    b.shutdown().await;

    let reason = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(MeshEvent::NodeDisconnected { node, reason }) if node == b_id => return reason,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("goodbye teardown expected");

    assert_eq!(reason, DisconnectReason::PeerBye);
    assert!(!a.reachable(b_id));

    a.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Malformed datagrams: counted, never fatal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_datagrams_counted_not_fatal() {
    let a = start_node("sturdy").await;

    let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    noise
        .send_to(&[0xDE, 0xAD, 0xBE, 0xEF], a.identity().data_addr)
        .await
        .unwrap();
    noise
        .send_to(&[0xFF; 64], a.identity().control_addr)
        .await
        .unwrap();

    wait_until("malformed counter", || a.status().malformed_packets >= 2).await;

    // The node still works: a route still delivers locally
    let input = a.register_input(1, "In");
    let (port, mut received) = ChannelPort::new();
    a.register_output(2, "Out", port);
    a.routes().add((a.local_id(), 1), (a.local_id(), 2), 0);
    input.feed(&[0x90, 0x40, 0x7F]);
    let bytes = recv_timeout(&mut received, "local delivery").await;
    assert_eq!(bytes, vec![0x90, 0x40, 0x7F]);

    a.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Version mismatch: hello is dropped, initiator gets nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn version_mismatch_hello_ignored() {
    let a = start_node("strict").await;

    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hello = HelloPacket {
        protocol_version: PROTOCOL_VERSION + 1,
        node: NodeWire {
            id: NodeId::generate(),
            name: "future".to_string(),
            data_addr: "127.0.0.1:9".parse().unwrap(),
        },
        devices: vec![],
        links: vec![],
    };
    let mut buf = Vec::new();
    hello.encode_request(&mut buf);
    control
        .send_to(&buf, a.identity().control_addr)
        .await
        .unwrap();

    let mut recv_buf = [0u8; 1500];
    let response =
        tokio::time::timeout(Duration::from_millis(500), control.recv_from(&mut recv_buf)).await;
    assert!(response.is_err(), "mismatched hello must get no response");
    assert!(a.status().connections.is_empty());

    a.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Route disable: a disabled route stops forwarding without deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disabled_route_stops_forwarding() {
    let a = start_node("toggle-a").await;
    let b = start_node("toggle-b").await;

    let input = a.register_input(1, "In");
    let (port, mut received) = ChannelPort::new();
    b.register_output(2, "Out", port);

    link(&a, &b).await;
    let b_id = b.local_id();
    wait_until("remote device", || a.registry().contains(b_id, 2)).await;

    a.routes().add((a.local_id(), 1), (b_id, 2), 0);
    input.feed(&[0x90, 0x3C, 0x64]);
    recv_timeout(&mut received, "first delivery").await;

    a.routes().set_enabled((a.local_id(), 1), (b_id, 2), false);
    let dropped_before = a.status().router.dropped;
    input.feed(&[0x90, 0x3D, 0x64]);

    // The disabled route counts a drop instead of delivering
    wait_until("drop after disable", || {
        a.status().router.dropped > dropped_before
    })
    .await;
    assert!(received.try_recv().is_err());

    a.shutdown().await;
    b.shutdown().await;
}
