use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use mesh_protocol::identity::{DeviceDesc, NodeId, NodeIdentity};
use mesh_protocol::packets::{AdvertPacket, HelloPacket, NodeWire};

use crate::config::MeshConfig;
use crate::manager::{Command, MeshEvent};
use crate::pool::ConnectionPool;
use crate::ports::OutputTable;
use crate::registry::DeviceRegistry;
use crate::routing::RoutingTable;
use crate::topology::LinkMap;

/// Everything the mesh tasks share, constructed once at startup and
/// passed by `Arc` — there is no ambient global state.
pub struct MeshContext {
    pub config: MeshConfig,
    pub identity: NodeIdentity,
    pub pool: Arc<ConnectionPool>,
    pub registry: Arc<DeviceRegistry>,
    pub routes: Arc<RoutingTable>,
    pub links: Arc<LinkMap>,
    pub outputs: Arc<OutputTable>,
    /// Shared sockets: every connection sends data on `data_socket`;
    /// all control traffic shares `control_socket`.
    pub control_socket: Arc<UdpSocket>,
    pub data_socket: Arc<UdpSocket>,
    /// Datagrams the codec rejected
    pub malformed: AtomicU64,
    /// In-flight outbound handshakes awaiting a HelloResponse
    pub pending_hellos: Mutex<HashMap<NodeId, oneshot::Sender<HelloPacket>>>,
    /// Mutating work funneled to the manager task
    pub commands_tx: mpsc::Sender<Command>,
    /// Mesh membership events for the surrounding application
    pub events_tx: broadcast::Sender<MeshEvent>,
}

impl MeshContext {
    pub fn local_id(&self) -> NodeId {
        self.identity.id
    }

    /// Descriptors of the devices this node owns, for hellos and adverts.
    pub fn local_devices(&self) -> Vec<DeviceDesc> {
        self.registry
            .list_node(self.identity.id)
            .iter()
            .map(|d| d.desc())
            .collect()
    }

    /// This node's wire identity. Only IPv4 data endpoints go on the
    /// wire; the bound sockets are IPv4.
    pub fn node_wire(&self) -> NodeWire {
        let data_addr = match self.identity.data_addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)
            }
        };
        NodeWire {
            id: self.identity.id,
            name: self.identity.name.clone(),
            data_addr,
        }
    }

    pub fn own_hello(&self) -> HelloPacket {
        HelloPacket {
            protocol_version: mesh_protocol::PROTOCOL_VERSION,
            node: self.node_wire(),
            devices: self.local_devices(),
            links: self.pool.active_peers(),
        }
    }

    pub fn own_advert(&self) -> AdvertPacket {
        AdvertPacket {
            node: self.identity.id,
            devices: self.local_devices(),
            links: self.pool.active_peers(),
        }
    }

    /// Fire-and-forget datagram on the control socket.
    pub async fn send_control(&self, bytes: &[u8], dest: SocketAddr) {
        if let Err(e) = self.control_socket.send_to(bytes, dest).await {
            debug!(dest = %dest, error = %e, "Control send failed");
        }
    }

    /// Send a control datagram to every connected peer, optionally
    /// skipping one (typically the peer the information came from).
    pub async fn broadcast_control(&self, bytes: &[u8], except: Option<NodeId>) {
        let peers = self.pool.list_active();
        for conn in peers {
            if Some(conn.peer.id) == except {
                continue;
            }
            self.send_control(bytes, conn.peer.control_addr).await;
        }
    }

    pub fn emit(&self, event: MeshEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }
}
