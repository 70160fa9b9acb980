pub mod identity;
pub mod packets;
pub mod reorder;
pub mod rtqueue;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// mDNS service type for mesh peer announcement
pub const MDNS_SERVICE_TYPE: &str = "_midimesh._udp.local.";

/// Default ports
pub const DEFAULT_DATA_PORT: u16 = 5004;
pub const DEFAULT_CONTROL_PORT: u16 = 5005;

/// Heartbeat defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;

/// Handshake defaults
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_HANDSHAKE_RETRY_MS: u64 = 500;

/// Reorder buffer defaults. The skip timeout matches the liveness horizon:
/// a gap that outlives peer-death detection will never be filled.
pub const DEFAULT_REORDER_CAPACITY: usize = 64;
pub const DEFAULT_REORDER_SKIP_MS: u64 = 3000;

/// Largest MIDI payload carried in a single data packet. Covers every
/// standard MIDI 1.0 message and the SysEx sizes LAN controllers produce.
pub const MAX_PAYLOAD: usize = 1024;

/// Largest datagram either socket will accept.
pub const MAX_DATAGRAM: usize = 1500;

/// Timestamp in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
