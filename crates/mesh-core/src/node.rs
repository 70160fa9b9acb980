use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mesh_protocol::identity::{DeviceId, NodeId, NodeIdentity, PortDirection};
use mesh_protocol::packets::ByePacket;
use mesh_protocol::rtqueue::{InputConsumer, SLOT_SIZE};

use crate::config::MeshConfig;
use crate::context::MeshContext;
use crate::control_plane;
use crate::data_plane;
use crate::heartbeat;
use crate::manager::{self, DiscoveryEvent, MeshEvent};
use crate::pool::ConnectionPool;
use crate::ports::{local_input, LocalInput, OutputPort, OutputTable};
use crate::registry::{Device, DeviceRegistry};
use crate::router::MidiRouter;
use crate::routing::RoutingTable;
use crate::sockets;
use crate::stats::{ConnectionStats, MeshStatus};
use crate::topology::LinkMap;

/// One running mesh node: sockets bound, tasks spawned.
pub struct MeshNode;

impl MeshNode {
    /// Bind the control and data sockets and start every mesh task.
    /// With port 0 in the config, ephemeral ports are used and reported
    /// through the returned handle's identity.
    pub async fn start(config: MeshConfig, name: impl Into<String>) -> anyhow::Result<MeshNodeHandle> {
        let control_socket = Arc::new(sockets::bind_udp(
            &config.network.bind_addr,
            config.network.control_port,
        )?);
        let data_socket = Arc::new(sockets::bind_udp(
            &config.network.bind_addr,
            config.network.data_port,
        )?);

        let identity = NodeIdentity {
            id: NodeId::generate(),
            name: name.into(),
            control_addr: control_socket.local_addr()?,
            data_addr: data_socket.local_addr()?,
        };

        let (commands_tx, commands_rx) = mpsc::channel(128);
        let (discovery_tx, discovery_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(64);

        let ctx = Arc::new(MeshContext {
            config,
            identity: identity.clone(),
            pool: Arc::new(ConnectionPool::new()),
            registry: Arc::new(DeviceRegistry::new()),
            routes: Arc::new(RoutingTable::new()),
            links: Arc::new(LinkMap::new()),
            outputs: Arc::new(OutputTable::new()),
            control_socket,
            data_socket,
            malformed: AtomicU64::new(0),
            pending_hellos: Mutex::new(HashMap::new()),
            commands_tx,
            events_tx,
        });

        let router = Arc::new(MidiRouter::new(
            identity.id,
            Arc::clone(&ctx.routes),
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.pool),
            Arc::clone(&ctx.links),
            Arc::clone(&ctx.outputs),
        ));

        let cancel = CancellationToken::new();

        tokio::spawn(control_plane::run(Arc::clone(&ctx), cancel.child_token()));
        tokio::spawn(data_plane::run(
            Arc::clone(&ctx),
            Arc::clone(&router),
            cancel.child_token(),
        ));
        tokio::spawn(heartbeat::run(
            Arc::clone(&ctx),
            Arc::clone(&router),
            cancel.child_token(),
        ));
        tokio::spawn(manager::run(
            Arc::clone(&ctx),
            discovery_rx,
            commands_rx,
            cancel.child_token(),
        ));

        info!(
            node = %identity.id,
            name = %identity.name,
            control = %identity.control_addr,
            data = %identity.data_addr,
            "Mesh node started"
        );

        Ok(MeshNodeHandle {
            ctx,
            router,
            discovery_tx,
            cancel,
        })
    }
}

/// Handle to a running node. Registration, status, and shutdown for the
/// surrounding application; the discovery feed plugs in here too.
pub struct MeshNodeHandle {
    ctx: Arc<MeshContext>,
    router: Arc<MidiRouter>,
    discovery_tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
}

impl MeshNodeHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    pub fn local_id(&self) -> NodeId {
        self.ctx.identity.id
    }

    /// Where the discovery transport feeds node appeared/disappeared
    /// events.
    pub fn discovery(&self) -> mpsc::Sender<DiscoveryEvent> {
        self.discovery_tx.clone()
    }

    /// Subscribe to membership events.
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.ctx.events_tx.subscribe()
    }

    pub fn routes(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.ctx.routes)
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Whether `node` is currently a viable destination: directly
    /// connected, or one hop away through a peer advertising it.
    pub fn reachable(&self, node: NodeId) -> bool {
        self.ctx.pool.get_connected(node).is_some() || self.ctx.links.via_for(node).is_some()
    }

    /// Register a local input port. The returned handle's `feed` is what
    /// the platform MIDI callback invokes; a pump task drains it into
    /// the router.
    pub fn register_input(&self, device: DeviceId, name: impl Into<String>) -> LocalInput {
        let name = name.into();
        self.ctx.registry.add(Device {
            node: self.ctx.identity.id,
            id: device,
            name,
            direction: PortDirection::Input,
        });

        let (input, consumer) = local_input(device, self.ctx.config.buffer.input_queue);
        spawn_input_pump(Arc::clone(&self.router), consumer, self.cancel.child_token());
        self.advertise();
        input
    }

    /// Register a local output port: the delivery target for anything
    /// routed to `(this node, device)`.
    pub fn register_output(
        &self,
        device: DeviceId,
        name: impl Into<String>,
        port: Arc<dyn OutputPort>,
    ) {
        self.ctx.registry.add(Device {
            node: self.ctx.identity.id,
            id: device,
            name: name.into(),
            direction: PortDirection::Output,
        });
        self.ctx.outputs.register(device, port);
        self.advertise();
    }

    pub fn unregister_device(&self, device: DeviceId) {
        self.ctx.registry.remove(self.ctx.identity.id, device);
        self.ctx.outputs.unregister(device);
        self.advertise();
    }

    /// Point-in-time mesh snapshot: the query surface for an API/CLI
    /// layer.
    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            node: self.ctx.identity.id.to_string(),
            node_name: self.ctx.identity.name.clone(),
            connections: self
                .ctx
                .pool
                .list_all()
                .iter()
                .map(|c| ConnectionStats::of(c))
                .collect(),
            devices: self.ctx.registry.list(),
            routes: self.ctx.routes.list(),
            router: self.router.counters.snapshot(),
            malformed_packets: self.ctx.malformed.load(Ordering::Relaxed),
        }
    }

    /// Stop the node: best-effort goodbye to every peer, close all
    /// connections, cancel the tasks.
    pub async fn shutdown(&self) {
        debug!(node = %self.ctx.identity.id, "Mesh node shutting down");

        let bye = ByePacket {
            node: self.ctx.identity.id,
        };
        let mut buf = [0u8; ByePacket::SIZE];
        bye.encode(&mut buf);

        for conn in self.ctx.pool.list_active() {
            self.ctx.send_control(&buf, conn.peer.control_addr).await;
        }
        for conn in self.ctx.pool.list_all() {
            conn.close();
            self.ctx.pool.remove(conn.peer.id);
        }

        self.cancel.cancel();
    }

    /// Push a fresh advert of our device/link set to all peers.
    fn advertise(&self) {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut buf = Vec::new();
            ctx.own_advert().encode(&mut buf);
            ctx.broadcast_control(&buf, None).await;
        });
    }
}

/// Per-input pump: drains one input queue into the router. The feed side
/// is lock-free; everything that can block happens here, on the async
/// side.
fn spawn_input_pump(router: Arc<MidiRouter>, consumer: InputConsumer, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = [0u8; SLOT_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                (device, len) = consumer.pop(&mut buf) => {
                    router.handle_local(device, &buf[..len]);
                }
            }
        }
    });
}
