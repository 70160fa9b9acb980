use std::time::Duration;

use serde::Deserialize;

/// Mesh node configuration, loadable from TOML. Every field has a default
/// so a node runs with no config file at all.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub mesh: MeshSection,
    #[serde(default)]
    pub buffer: BufferSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    /// Interface address to bind both sockets on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// UDP port for MIDI data packets (0 = ephemeral)
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// UDP port for handshake/heartbeat/advert traffic (0 = ephemeral)
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshSection {
    /// Heartbeat send period
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Missed intervals before a peer is declared dead
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    /// Overall handshake deadline
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Gap between handshake retransmissions
    #[serde(default = "default_handshake_retry_ms")]
    pub handshake_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferSection {
    /// Pending-packet bound of each connection's reorder buffer
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,
    /// Gap age that forces a reorder skip-ahead
    #[serde(default = "default_reorder_skip_ms")]
    pub reorder_skip_ms: u64,
    /// Outbound send queue depth per connection
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Local input ring capacity per port (power of two)
    #[serde(default = "default_input_queue")]
    pub input_queue: usize,
}

fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_data_port() -> u16 { mesh_protocol::DEFAULT_DATA_PORT }
fn default_control_port() -> u16 { mesh_protocol::DEFAULT_CONTROL_PORT }
fn default_heartbeat_interval_ms() -> u64 { mesh_protocol::DEFAULT_HEARTBEAT_INTERVAL_MS }
fn default_heartbeat_miss_threshold() -> u32 { mesh_protocol::DEFAULT_HEARTBEAT_MISS_THRESHOLD }
fn default_handshake_timeout_ms() -> u64 { mesh_protocol::DEFAULT_HANDSHAKE_TIMEOUT_MS }
fn default_handshake_retry_ms() -> u64 { mesh_protocol::DEFAULT_HANDSHAKE_RETRY_MS }
fn default_reorder_capacity() -> usize { mesh_protocol::DEFAULT_REORDER_CAPACITY }
fn default_reorder_skip_ms() -> u64 { mesh_protocol::DEFAULT_REORDER_SKIP_MS }
fn default_send_queue() -> usize { 256 }
fn default_input_queue() -> usize { 1024 }

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_port: default_data_port(),
            control_port: default_control_port(),
        }
    }
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            handshake_retry_ms: default_handshake_retry_ms(),
        }
    }
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            reorder_capacity: default_reorder_capacity(),
            reorder_skip_ms: default_reorder_skip_ms(),
            send_queue: default_send_queue(),
            input_queue: default_input_queue(),
        }
    }
}

impl MeshConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.mesh.heartbeat_interval_ms)
    }

    /// Age of the last received heartbeat at which a peer is dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.mesh.heartbeat_interval_ms * u64::from(self.mesh.heartbeat_miss_threshold),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.mesh.handshake_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.mesh.handshake_retry_ms)
    }

    pub fn reorder_skip(&self) -> Duration {
        Duration::from_millis(self.buffer.reorder_skip_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config = MeshConfig::default();
        assert_eq!(config.network.data_port, 5004);
        assert_eq!(config.mesh.heartbeat_interval_ms, 1000);
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            [network]
            data_port = 0
            control_port = 0

            [mesh]
            heartbeat_interval_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.network.data_port, 0);
        assert_eq!(config.network.bind_addr, "0.0.0.0");
        assert_eq!(config.mesh.heartbeat_miss_threshold, 3);
        assert_eq!(config.heartbeat_timeout(), Duration::from_millis(300));
    }
}
