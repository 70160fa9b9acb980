use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// 128-bit node identifier, unique per running instance.
/// Generated once at startup and immutable for the process lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    pub const LEN: usize = 16;

    /// Generate a fresh id from the clock and process id.
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id() as u128;
        let mixed = nanos ^ (pid << 64) ^ (nanos.rotate_left(61));
        NodeId(mixed.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(bytes)
    }

    /// Parse the 32-character lowercase hex form produced by `Display`.
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(NodeId(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    /// Short form for logs: first 4 bytes of hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Device identifier, unique within its owning node.
pub type DeviceId = u16;

/// Direction of a MIDI port as seen from its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PortDirection {
    Input = 0x01,
    Output = 0x02,
}

impl PortDirection {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Input),
            0x02 => Some(Self::Output),
            _ => None,
        }
    }
}

/// A device as advertised over the wire: id + direction + display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDesc {
    pub id: DeviceId,
    pub direction: PortDirection,
    pub name: String,
}

/// Identity of one running node: who it is and where to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    /// Display name (e.g., "stage-left")
    pub name: String,
    /// Endpoint for handshake, heartbeats, and adverts
    pub control_addr: SocketAddr,
    /// Endpoint for MIDI data packets
    pub data_addr: SocketAddr,
}
