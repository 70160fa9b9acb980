//! mDNS feed adapter: the only place the daemon touches the discovery
//! transport.
//!
//! Registers this node as a `_midimesh._udp.local.` service and browses
//! for peers, translating resolved/removed services into the
//! `DiscoveryEvent` stream the mesh core consumes. The core never sees
//! mDNS types.

use std::collections::HashMap;
use std::net::SocketAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mesh_core::manager::{DiscoveryEvent, NodeAnnouncement};
use mesh_protocol::identity::{NodeId, NodeIdentity};
use mesh_protocol::{MDNS_SERVICE_TYPE, PROTOCOL_VERSION};

/// Advertise this node on the LAN until cancelled.
pub async fn register(
    identity: NodeIdentity,
    device_count: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mdns = ServiceDaemon::new()?;

    let instance_name = format!("{} ({:?})", identity.name, identity.id);

    let mut properties = HashMap::new();
    properties.insert("id".to_string(), identity.id.to_string());
    properties.insert("name".to_string(), identity.name.clone());
    properties.insert("data".to_string(), identity.data_addr.port().to_string());
    properties.insert("ver".to_string(), PROTOCOL_VERSION.to_string());
    properties.insert("devs".to_string(), device_count.to_string());

    let service_info = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", identity.name),
        "",
        identity.control_addr.port(),
        properties,
    )?
    .enable_addr_auto();

    mdns.register(service_info)?;

    info!(
        instance = %instance_name,
        service_type = MDNS_SERVICE_TYPE,
        "mDNS service registered"
    );

    cancel.cancelled().await;

    if let Err(e) = mdns.unregister(&format!("{}.{}", instance_name, MDNS_SERVICE_TYPE)) {
        error!("Failed to unregister mDNS service: {}", e);
    }
    mdns.shutdown()?;

    Ok(())
}

/// Browse for peers and feed the discovery channel until cancelled.
pub async fn browse(
    local_id: NodeId,
    events: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mdns = ServiceDaemon::new()?;
    let receiver = mdns.browse(MDNS_SERVICE_TYPE)?;

    info!(service_type = MDNS_SERVICE_TYPE, "Browsing for mesh peers");

    // fullname -> node id, so removals can be translated
    let mut known: HashMap<String, NodeId> = HashMap::new();

    loop {
        // recv_async() yields to the runtime instead of blocking the
        // executor thread.
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv_async() => match event {
                Ok(event) => event,
                Err(e) => {
                    error!("mDNS browse channel closed: {}", e);
                    return Err(anyhow::anyhow!("mDNS browse channel closed unexpectedly"));
                }
            }
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(ann) = parse_resolved(&info) else {
                    debug!(name = %info.get_fullname(), "Ignoring unparsable mesh service");
                    continue;
                };
                if ann.id == local_id {
                    continue; // our own advertisement
                }

                info!(
                    peer = ?ann.id,
                    name = %ann.name,
                    control = %ann.control_addr,
                    devices = ann.device_count,
                    "Discovered mesh peer"
                );
                known.insert(info.get_fullname().to_string(), ann.id);
                let _ = events.send(DiscoveryEvent::NodeUp(ann)).await;
            }

            ServiceEvent::ServiceRemoved(_, fullname) => {
                let Some(id) = known.remove(&fullname) else {
                    continue;
                };
                info!(peer = ?id, name = %fullname, "Mesh peer left the network");
                let _ = events.send(DiscoveryEvent::NodeDown(id)).await;
            }

            ServiceEvent::SearchStarted(ty) => {
                debug!(service_type = %ty, "mDNS search started");
            }

            ServiceEvent::SearchStopped(ty) => {
                debug!(service_type = %ty, "mDNS search stopped");
            }

            ServiceEvent::ServiceFound(ty, fullname) => {
                debug!(service_type = %ty, name = %fullname, "mDNS service found (awaiting resolution)");
            }
        }
    }

    mdns.shutdown()?;
    Ok(())
}

/// Extract a node announcement from a resolved service, or None when a
/// required property is missing or malformed.
fn parse_resolved(info: &mdns_sd::ServiceInfo) -> Option<NodeAnnouncement> {
    let properties = info.get_properties();

    let id = properties
        .get_property_val_str("id")
        .and_then(NodeId::parse_hex)?;

    let name = properties
        .get_property_val_str("name")
        .unwrap_or("unknown")
        .to_string();

    let data_port: u16 = properties
        .get_property_val_str("data")
        .and_then(|s| s.parse().ok())?;

    let device_count: u16 = properties
        .get_property_val_str("devs")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if let Some(ver) = properties
        .get_property_val_str("ver")
        .and_then(|s| s.parse::<u8>().ok())
    {
        if ver != PROTOCOL_VERSION {
            warn!(
                peer = ?id,
                peer_version = ver,
                our_version = PROTOCOL_VERSION,
                "Peer protocol version differs — handshake will decide"
            );
        }
    }

    // Prefer an IPv4 address; the wire identity is IPv4
    let ip = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .copied()?;

    Some(NodeAnnouncement {
        id,
        name,
        control_addr: SocketAddr::new(ip, info.get_port()),
        data_addr: SocketAddr::new(ip, data_port),
        device_count,
    })
}
