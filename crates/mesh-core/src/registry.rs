use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use mesh_protocol::identity::{DeviceDesc, DeviceId, NodeId, PortDirection};

/// One known MIDI device, local or remote-advertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub node: NodeId,
    pub id: DeviceId,
    pub name: String,
    pub direction: PortDirection,
}

impl Device {
    pub fn key(&self) -> (NodeId, DeviceId) {
        (self.node, self.id)
    }

    pub fn desc(&self) -> DeviceDesc {
        DeviceDesc {
            id: self.id,
            direction: self.direction,
            name: self.name.clone(),
        }
    }
}

/// Every device the node knows about, keyed by (owning node, device id).
///
/// Local devices are added when the platform I/O layer registers a port;
/// remote devices arrive with a peer's handshake or advert and leave when
/// that peer disconnects. Concurrent readers, infrequent writers; the lock
/// is never held across I/O.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<BTreeMap<(NodeId, DeviceId), Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update. Returns true if the device was new.
    pub fn add(&self, device: Device) -> bool {
        let mut map = self.inner.write().unwrap();
        map.insert(device.key(), device).is_none()
    }

    pub fn remove(&self, node: NodeId, id: DeviceId) -> Option<Device> {
        self.inner.write().unwrap().remove(&(node, id))
    }

    pub fn get(&self, node: NodeId, id: DeviceId) -> Option<Device> {
        self.inner.read().unwrap().get(&(node, id)).cloned()
    }

    pub fn contains(&self, node: NodeId, id: DeviceId) -> bool {
        self.inner.read().unwrap().contains_key(&(node, id))
    }

    /// All devices, ordered by (node, id). For UI/API consumption.
    pub fn list(&self) -> Vec<Device> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Devices owned by one node.
    pub fn list_node(&self, node: NodeId) -> Vec<Device> {
        self.inner
            .read()
            .unwrap()
            .range((node, DeviceId::MIN)..=(node, DeviceId::MAX))
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Drop every device owned by `node` (peer disconnected).
    /// Returns how many were removed.
    pub fn remove_node(&self, node: NodeId) -> usize {
        let mut map = self.inner.write().unwrap();
        let keys: Vec<_> = map
            .range((node, DeviceId::MIN)..=(node, DeviceId::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            map.remove(key);
        }
        keys.len()
    }

    /// Replace a node's device set with a freshly advertised one.
    pub fn replace_node(&self, node: NodeId, descs: &[DeviceDesc]) {
        let mut map = self.inner.write().unwrap();
        let keys: Vec<_> = map
            .range((node, DeviceId::MIN)..=(node, DeviceId::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            map.remove(&key);
        }
        for desc in descs {
            let device = Device {
                node,
                id: desc.id,
                name: desc.name.clone(),
                direction: desc.direction,
            };
            map.insert(device.key(), device);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
