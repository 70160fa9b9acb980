use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use mesh_protocol::identity::NodeIdentity;
use mesh_protocol::packets::MidiPacket;
use mesh_protocol::reorder::{ReorderBuffer, ReorderStats};

use crate::config::MeshConfig;

/// Connection lifecycle. Transitions are monotonic:
/// `Disconnected → Connecting → Connected → Disconnected`, with
/// `Connecting → Failed → Disconnected` on handshake timeout and
/// `Connected → Disconnected` on heartbeat timeout or explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnState {
    /// Whether `self → next` is a legal transition.
    fn allows(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Disconnected)
        )
    }
}

/// Atomic counters on one connection's data path.
#[derive(Default)]
pub struct ConnCounters {
    /// Data packets handed to the socket
    pub packets_sent: AtomicU64,
    /// Data packets accepted from the wire (pre-reorder)
    pub packets_received: AtomicU64,
    /// Sends dropped at the queue (full or closed)
    pub send_dropped: AtomicU64,
}

/// One peer relationship: state machine, heartbeat bookkeeping, outbound
/// queue, inbound reorder buffer, counters.
///
/// Shared as `Arc<NetworkConnection>` between the I/O tasks and the
/// control path; every public method is safe to call from any of them.
/// Locks guard plain state only and are never held across I/O.
pub struct NetworkConnection {
    pub peer: NodeIdentity,
    state: RwLock<ConnState>,
    connected_at: Mutex<Option<Instant>>,
    last_heartbeat_tx: Mutex<Option<Instant>>,
    last_heartbeat_rx: Mutex<Instant>,
    heartbeat_seq: AtomicU32,
    /// Next outbound data sequence number; strictly increasing per
    /// connection. A sequence consumed by a dropped send reads as wire
    /// loss at the peer, which the reorder buffer already absorbs.
    next_seq: AtomicU32,
    tx: Mutex<Option<mpsc::Sender<MidiPacket>>>,
    reorder: Mutex<ReorderBuffer>,
    pub counters: ConnCounters,
}

impl NetworkConnection {
    /// Create a connection in the given initial state. Returns the
    /// receiving end of the outbound queue for `run_sender`.
    pub fn new(
        peer: NodeIdentity,
        initial: ConnState,
        config: &MeshConfig,
    ) -> (Arc<Self>, mpsc::Receiver<MidiPacket>) {
        let (tx, rx) = mpsc::channel(config.buffer.send_queue);
        let conn = Arc::new(Self {
            peer,
            state: RwLock::new(initial),
            connected_at: Mutex::new(None),
            last_heartbeat_tx: Mutex::new(None),
            last_heartbeat_rx: Mutex::new(Instant::now()),
            heartbeat_seq: AtomicU32::new(0),
            next_seq: AtomicU32::new(0),
            tx: Mutex::new(Some(tx)),
            reorder: Mutex::new(ReorderBuffer::new(
                config.buffer.reorder_capacity,
                config.reorder_skip(),
            )),
            counters: ConnCounters::default(),
        });
        (conn, rx)
    }

    pub fn state(&self) -> ConnState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Attempt a state transition. Illegal transitions are ignored with a
    /// warning; same-state transitions are silent no-ops. Returns whether
    /// the transition happened.
    pub fn transition(&self, next: ConnState) -> bool {
        let mut state = self.state.write().unwrap();
        if *state == next {
            return false;
        }
        if !state.allows(next) {
            warn!(
                peer = ?self.peer.id,
                from = ?*state,
                to = ?next,
                "Ignoring illegal connection state transition"
            );
            return false;
        }
        trace!(peer = ?self.peer.id, from = ?*state, to = ?next, "Connection state change");
        *state = next;
        if next == ConnState::Connected {
            *self.connected_at.lock().unwrap() = Some(Instant::now());
            *self.last_heartbeat_rx.lock().unwrap() = Instant::now();
        }
        true
    }

    /// Enqueue a packet for transmission. Non-blocking: assigns the
    /// connection's next sequence number and drops (counted) if the
    /// queue is full or the connection is not `Connected`.
    pub fn send(&self, mut packet: MidiPacket) -> bool {
        if !self.is_connected() {
            self.counters.send_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        packet.sequence = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let tx = self.tx.lock().unwrap();
        match tx.as_ref().map(|tx| tx.try_send(packet)) {
            Some(Ok(())) => true,
            _ => {
                self.counters.send_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Run one received data packet through the reorder buffer; returns
    /// the packets that became deliverable, in order.
    pub fn accept_data(&self, packet: MidiPacket, now: Instant) -> Vec<MidiPacket> {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.reorder.lock().unwrap().offer(packet, now)
    }

    /// Force reorder progress past an expired gap.
    pub fn flush_reorder(&self, now: Instant) -> Vec<MidiPacket> {
        self.reorder.lock().unwrap().flush_expired(now)
    }

    pub fn reorder_stats(&self) -> ReorderStats {
        self.reorder.lock().unwrap().stats()
    }

    // -- Heartbeat bookkeeping --

    pub fn record_heartbeat(&self, _sequence: u32) {
        *self.last_heartbeat_rx.lock().unwrap() = Instant::now();
    }

    pub fn heartbeat_rx_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_heartbeat_rx.lock().unwrap())
    }

    pub fn mark_heartbeat_sent(&self) {
        *self.last_heartbeat_tx.lock().unwrap() = Some(Instant::now());
    }

    pub fn next_heartbeat_seq(&self) -> u32 {
        self.heartbeat_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Seconds this connection has been `Connected`, if it is.
    pub fn uptime(&self) -> Option<Duration> {
        if !self.is_connected() {
            return None;
        }
        self.connected_at.lock().unwrap().map(|t| t.elapsed())
    }

    /// Close the connection. Idempotent from any state: the outbound
    /// queue is closed (the sender task drains what is already queued,
    /// then exits), pending reorder entries are discarded, and the state
    /// lands on `Disconnected`.
    pub fn close(&self) {
        let had_tx = self.tx.lock().unwrap().take().is_some();
        self.reorder.lock().unwrap().clear();

        let mut state = self.state.write().unwrap();
        if *state != ConnState::Disconnected {
            *state = ConnState::Disconnected;
        }
        drop(state);

        if had_tx {
            debug!(peer = ?self.peer.id, "Connection closed");
        }
    }
}

/// Per-connection sender task: drains the outbound queue, encodes, and
/// sends on the shared data socket. Exits when the queue is closed,
/// after delivering whatever was already enqueued (best-effort drain).
pub async fn run_sender(
    conn: Arc<NetworkConnection>,
    mut rx: mpsc::Receiver<MidiPacket>,
    socket: Arc<UdpSocket>,
) {
    let dest = conn.peer.data_addr;
    let mut buf = Vec::with_capacity(mesh_protocol::MAX_DATAGRAM);

    while let Some(packet) = rx.recv().await {
        packet.encode(&mut buf);
        match socket.send_to(&buf, dest).await {
            Ok(_) => {
                conn.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                conn.counters.send_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(peer = ?conn.peer.id, error = %e, "Data send failed");
            }
        }
    }

    trace!(peer = ?conn.peer.id, "Sender task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_protocol::identity::NodeId;

    fn peer() -> NodeIdentity {
        NodeIdentity {
            id: NodeId::from_bytes([7; 16]),
            name: "peer".to_string(),
            control_addr: "127.0.0.1:5005".parse().unwrap(),
            data_addr: "127.0.0.1:5004".parse().unwrap(),
        }
    }

    fn packet() -> MidiPacket {
        MidiPacket {
            sequence: 0,
            source: NodeId::from_bytes([1; 16]),
            dest_node: NodeId::from_bytes([7; 16]),
            dest_device: 0,
            timestamp_us: 0,
            payload: vec![0x90, 0x3C, 0x64],
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Disconnected, &MeshConfig::default());
        assert!(conn.transition(ConnState::Connecting));
        assert!(conn.transition(ConnState::Connected));
        assert!(conn.transition(ConnState::Disconnected));
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn handshake_failure_path() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Connecting, &MeshConfig::default());
        assert!(conn.transition(ConnState::Failed));
        assert!(conn.transition(ConnState::Disconnected));
    }

    #[test]
    fn illegal_transitions_ignored() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Disconnected, &MeshConfig::default());
        // Cannot jump straight to Connected
        assert!(!conn.transition(ConnState::Connected));
        assert_eq!(conn.state(), ConnState::Disconnected);

        conn.transition(ConnState::Connecting);
        conn.transition(ConnState::Connected);
        // Cannot regress to Connecting
        assert!(!conn.transition(ConnState::Connecting));
        assert_eq!(conn.state(), ConnState::Connected);
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Connecting, &MeshConfig::default());
        conn.transition(ConnState::Connected);
        conn.close();
        assert_eq!(conn.state(), ConnState::Disconnected);
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnState::Disconnected);
    }

    #[test]
    fn send_assigns_monotonic_sequences() {
        let (conn, mut rx) = NetworkConnection::new(peer(), ConnState::Connecting, &MeshConfig::default());
        conn.transition(ConnState::Connected);

        assert!(conn.send(packet()));
        assert!(conn.send(packet()));
        assert!(conn.send(packet()));

        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
    }

    #[test]
    fn send_drops_when_not_connected() {
        let (conn, mut rx) = NetworkConnection::new(peer(), ConnState::Disconnected, &MeshConfig::default());
        assert!(!conn.send(packet()));
        assert_eq!(conn.counters.send_dropped.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_drops() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Connecting, &MeshConfig::default());
        conn.transition(ConnState::Connected);
        conn.close();
        assert!(!conn.send(packet()));
        assert_eq!(conn.counters.send_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn heartbeat_elapsed_tracks_receipt() {
        let (conn, _rx) = NetworkConnection::new(peer(), ConnState::Connecting, &MeshConfig::default());
        conn.transition(ConnState::Connected);
        conn.record_heartbeat(1);

        let now = Instant::now();
        assert!(conn.heartbeat_rx_elapsed(now) < Duration::from_millis(100));
        assert!(conn.heartbeat_rx_elapsed(now + Duration::from_secs(4)) > Duration::from_secs(3));
    }

    #[tokio::test]
    async fn sender_drains_queue_after_close() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut identity = peer();
        identity.data_addr = sink.local_addr().unwrap();

        let (conn, rx) = NetworkConnection::new(identity, ConnState::Connecting, &MeshConfig::default());
        conn.transition(ConnState::Connected);

        conn.send(packet());
        conn.send(packet());
        conn.close();

        // Sender started after close must still flush the queued packets
        let handle = tokio::spawn(run_sender(Arc::clone(&conn), rx, socket));
        handle.await.unwrap();

        let mut buf = [0u8; 1500];
        for _ in 0..2 {
            let (len, _) = sink.recv_from(&mut buf).await.unwrap();
            assert!(MidiPacket::decode(&buf[..len]).is_ok());
        }
        assert_eq!(conn.counters.packets_sent.load(Ordering::Relaxed), 2);
    }
}
