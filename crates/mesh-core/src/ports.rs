use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use mesh_protocol::identity::DeviceId;
use mesh_protocol::rtqueue::{input_queue, InputConsumer, InputProducer};

/// Outbound half of a local MIDI port: something that can accept bytes
/// for delivery to the platform device. The platform I/O layer implements
/// this; the router only ever calls `send`.
pub trait OutputPort: Send + Sync {
    fn send(&self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Local output ports by device id. Delivery is a read-lock map hit plus
/// one trait call; the registered port must itself be non-blocking.
#[derive(Default)]
pub struct OutputTable {
    inner: RwLock<HashMap<DeviceId, Arc<dyn OutputPort>>>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: DeviceId, port: Arc<dyn OutputPort>) {
        self.inner.write().unwrap().insert(device, port);
    }

    pub fn unregister(&self, device: DeviceId) {
        self.inner.write().unwrap().remove(&device);
    }

    /// Deliver bytes to a local device. Returns false when no port is
    /// registered under that id (the caller counts the drop).
    pub fn deliver(&self, device: DeviceId, bytes: &[u8]) -> bool {
        let port = self.inner.read().unwrap().get(&device).cloned();
        match port {
            Some(port) => {
                if let Err(e) = port.send(bytes) {
                    warn!(device = device, error = %e, "Local port send failed");
                }
                true
            }
            None => {
                debug!(device = device, "No local output port for device");
                false
            }
        }
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.inner.read().unwrap().contains_key(&device)
    }
}

/// Inbound half of a local MIDI port. The platform callback thread calls
/// `feed` (lock-free, never blocks); the input pump drains the queue on
/// the async side. One instance per registered input device.
pub struct LocalInput {
    device: DeviceId,
    producer: InputProducer,
}

impl LocalInput {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Hand one MIDI message to the mesh. Safe on a real-time thread:
    /// drop-oldest on overflow, counted.
    pub fn feed(&self, bytes: &[u8]) {
        self.producer.push(self.device, bytes);
    }

    /// Messages lost to queue overflow.
    pub fn overflow_dropped(&self) -> u64 {
        self.producer.dropped()
    }
}

/// Build the two halves of an input port: the handle the platform
/// callback keeps, and the consumer the input pump drains.
pub fn local_input(device: DeviceId, queue_capacity: usize) -> (LocalInput, InputConsumer) {
    let (producer, consumer) = input_queue(queue_capacity);
    (LocalInput { device, producer }, consumer)
}
