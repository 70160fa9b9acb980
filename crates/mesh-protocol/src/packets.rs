use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::identity::{DeviceDesc, DeviceId, NodeId, PortDirection};
use crate::MAX_PAYLOAD;

// -- Magic bytes for control packet identification --

pub const MAGIC_HELLO_REQ: [u8; 4] = *b"MMHR";
pub const MAGIC_HELLO_RESP: [u8; 4] = *b"MMHA";
pub const MAGIC_HEARTBEAT: [u8; 4] = *b"MMHB";
pub const MAGIC_ADVERT: [u8; 4] = *b"MMAD";
pub const MAGIC_BYE: [u8; 4] = *b"MMBY";

/// Why a datagram failed to decode. Decode failures are counted and the
/// datagram dropped; they are never propagated as task failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header requires
    Truncated,
    /// Unknown or missing magic prefix
    BadMagic,
    /// A length field disagrees with the bytes actually present
    LengthMismatch,
    /// A field holds a value outside its domain
    BadField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "datagram truncated"),
            DecodeError::BadMagic => write!(f, "unknown packet magic"),
            DecodeError::LengthMismatch => write!(f, "length field mismatch"),
            DecodeError::BadField(field) => write!(f, "invalid field: {}", field),
        }
    }
}

impl std::error::Error for DecodeError {}

// -- Byte-walking helpers shared by the decoders --

fn take_u8(data: &[u8], offset: &mut usize) -> Result<u8, DecodeError> {
    let v = *data.get(*offset).ok_or(DecodeError::Truncated)?;
    *offset += 1;
    Ok(v)
}

fn take_u16(data: &[u8], offset: &mut usize) -> Result<u16, DecodeError> {
    let end = *offset + 2;
    let bytes = data.get(*offset..end).ok_or(DecodeError::Truncated)?;
    *offset = end;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_u32(data: &[u8], offset: &mut usize) -> Result<u32, DecodeError> {
    let end = *offset + 4;
    let bytes = data.get(*offset..end).ok_or(DecodeError::Truncated)?;
    *offset = end;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_u64(data: &[u8], offset: &mut usize) -> Result<u64, DecodeError> {
    let end = *offset + 8;
    let bytes = data.get(*offset..end).ok_or(DecodeError::Truncated)?;
    *offset = end;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn take_node_id(data: &[u8], offset: &mut usize) -> Result<NodeId, DecodeError> {
    let end = *offset + NodeId::LEN;
    let bytes = data.get(*offset..end).ok_or(DecodeError::Truncated)?;
    *offset = end;
    let mut buf = [0u8; 16];
    buf.copy_from_slice(bytes);
    Ok(NodeId::from_bytes(buf))
}

/// u8-length-prefixed UTF-8 string (lossy on decode, untrusted input).
fn take_string(data: &[u8], offset: &mut usize) -> Result<String, DecodeError> {
    let len = take_u8(data, offset)? as usize;
    let end = *offset + len;
    let bytes = data.get(*offset..end).ok_or(DecodeError::Truncated)?;
    *offset = end;
    Ok(String::from_utf8_lossy(bytes).to_string())
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

// -- MIDI data packet --
// One MIDI message plus routing metadata. The destination device id is
// preserved end-to-end so the final hop delivers without re-resolving
// routes; the destination node id is what intermediate hops route on.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPacket {
    /// Monotonic per connection at the sender
    pub sequence: u32,
    pub source: NodeId,
    pub dest_node: NodeId,
    pub dest_device: DeviceId,
    pub timestamp_us: u64,
    /// Raw MIDI bytes. Length is explicit on the wire — SysEx has no
    /// fixed length, so it is never inferred from status bytes.
    pub payload: Vec<u8>,
}

impl MidiPacket {
    /// seq(4) + source(16) + dest_node(16) + dest_device(2) + timestamp(8) + payload_len(2)
    pub const HEADER_SIZE: usize = 48;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(self.source.as_bytes());
        buf.extend_from_slice(self.dest_node.as_bytes());
        buf.extend_from_slice(&self.dest_device.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        let len = self.payload.len().min(MAX_PAYLOAD) as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload[..len as usize]);
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        let mut offset = 0;
        let sequence = take_u32(data, &mut offset)?;
        let source = take_node_id(data, &mut offset)?;
        let dest_node = take_node_id(data, &mut offset)?;
        let dest_device = take_u16(data, &mut offset)?;
        let timestamp_us = take_u64(data, &mut offset)?;
        let payload_len = take_u16(data, &mut offset)? as usize;

        if payload_len > MAX_PAYLOAD {
            return Err(DecodeError::BadField("payload_len"));
        }
        if data.len() - offset != payload_len {
            return Err(DecodeError::LengthMismatch);
        }

        Ok(Self {
            sequence,
            source,
            dest_node,
            dest_device,
            timestamp_us,
            payload: data[offset..offset + payload_len].to_vec(),
        })
    }
}

// -- Node wire form --
// Identity fields a peer needs before any connection exists: who, what to
// call it, and where its data socket listens. The control address is taken
// from the datagram source.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWire {
    pub id: NodeId,
    pub name: String,
    pub data_addr: SocketAddrV4,
}

impl NodeWire {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        put_string(buf, &self.name);
        buf.extend_from_slice(&self.data_addr.ip().octets());
        buf.extend_from_slice(&self.data_addr.port().to_be_bytes());
    }

    fn decode(data: &[u8], offset: &mut usize) -> Result<Self, DecodeError> {
        let id = take_node_id(data, offset)?;
        let name = take_string(data, offset)?;
        let a = take_u8(data, offset)?;
        let b = take_u8(data, offset)?;
        let c = take_u8(data, offset)?;
        let d = take_u8(data, offset)?;
        let port = take_u16(data, offset)?;
        Ok(Self {
            id,
            name,
            data_addr: SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port),
        })
    }
}

fn encode_devices(buf: &mut Vec<u8>, devices: &[DeviceDesc]) {
    let count = devices.len().min(u8::MAX as usize);
    buf.push(count as u8);
    for dev in &devices[..count] {
        buf.extend_from_slice(&dev.id.to_be_bytes());
        buf.push(dev.direction as u8);
        put_string(buf, &dev.name);
    }
}

fn decode_devices(data: &[u8], offset: &mut usize) -> Result<Vec<DeviceDesc>, DecodeError> {
    let count = take_u8(data, offset)? as usize;
    let mut devices = Vec::with_capacity(count);
    for _ in 0..count {
        let id = take_u16(data, offset)?;
        let direction = PortDirection::from_u8(take_u8(data, offset)?)
            .ok_or(DecodeError::BadField("direction"))?;
        let name = take_string(data, offset)?;
        devices.push(DeviceDesc { id, direction, name });
    }
    Ok(devices)
}

fn encode_links(buf: &mut Vec<u8>, links: &[NodeId]) {
    let count = links.len().min(u8::MAX as usize);
    buf.push(count as u8);
    for link in &links[..count] {
        buf.extend_from_slice(link.as_bytes());
    }
}

fn decode_links(data: &[u8], offset: &mut usize) -> Result<Vec<NodeId>, DecodeError> {
    let count = take_u8(data, offset)? as usize;
    let mut links = Vec::with_capacity(count);
    for _ in 0..count {
        links.push(take_node_id(data, offset)?);
    }
    Ok(links)
}

// -- Handshake packets --
// Request and response carry the same shape: the sender's identity plus its
// current device list and direct-neighbor set, so a single exchange seeds
// the registry and link map on both sides.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPacket {
    pub protocol_version: u8,
    pub node: NodeWire,
    pub devices: Vec<DeviceDesc>,
    pub links: Vec<NodeId>,
}

impl HelloPacket {
    fn encode_with_magic(&self, buf: &mut Vec<u8>, magic: &[u8; 4]) {
        buf.clear();
        buf.extend_from_slice(magic);
        buf.push(self.protocol_version);
        self.node.encode(buf);
        encode_devices(buf, &self.devices);
        encode_links(buf, &self.links);
    }

    pub fn encode_request(&self, buf: &mut Vec<u8>) {
        self.encode_with_magic(buf, &MAGIC_HELLO_REQ);
    }

    pub fn encode_response(&self, buf: &mut Vec<u8>) {
        self.encode_with_magic(buf, &MAGIC_HELLO_RESP);
    }

    fn decode_body(data: &[u8]) -> Result<Self, DecodeError> {
        let mut offset = 4;
        let protocol_version = take_u8(data, &mut offset)?;
        let node = NodeWire::decode(data, &mut offset)?;
        let devices = decode_devices(data, &mut offset)?;
        let links = decode_links(data, &mut offset)?;
        Ok(Self {
            protocol_version,
            node,
            devices,
            links,
        })
    }
}

// -- Heartbeat packet (32 bytes) --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub node: NodeId,
    pub sequence: u32,
    pub timestamp_us: u64,
}

impl HeartbeatPacket {
    pub const SIZE: usize = 32; // magic(4) + node(16) + seq(4) + timestamp(8)

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&MAGIC_HEARTBEAT);
        buf[4..20].copy_from_slice(self.node.as_bytes());
        buf[20..24].copy_from_slice(&self.sequence.to_be_bytes());
        buf[24..32].copy_from_slice(&self.timestamp_us.to_be_bytes());
    }

    fn decode_body(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::SIZE {
            return Err(DecodeError::Truncated);
        }
        let mut offset = 4;
        Ok(Self {
            node: take_node_id(data, &mut offset)?,
            sequence: take_u32(data, &mut offset)?,
            timestamp_us: take_u64(data, &mut offset)?,
        })
    }
}

// -- Topology advert --
// Re-sent whenever a node's local device list or direct-neighbor set
// changes, keeping remote registries and relay selection current.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertPacket {
    pub node: NodeId,
    pub devices: Vec<DeviceDesc>,
    pub links: Vec<NodeId>,
}

impl AdvertPacket {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&MAGIC_ADVERT);
        buf.extend_from_slice(self.node.as_bytes());
        encode_devices(buf, &self.devices);
        encode_links(buf, &self.links);
    }

    fn decode_body(data: &[u8]) -> Result<Self, DecodeError> {
        let mut offset = 4;
        let node = take_node_id(data, &mut offset)?;
        let devices = decode_devices(data, &mut offset)?;
        let links = decode_links(data, &mut offset)?;
        Ok(Self { node, devices, links })
    }
}

// -- Goodbye packet (20 bytes) --
// Best-effort notice on shutdown so peers tear down immediately instead of
// waiting out the heartbeat timeout.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByePacket {
    pub node: NodeId,
}

impl ByePacket {
    pub const SIZE: usize = 20; // magic(4) + node(16)

    pub fn encode(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&MAGIC_BYE);
        buf[4..20].copy_from_slice(self.node.as_bytes());
    }

    fn decode_body(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::SIZE {
            return Err(DecodeError::Truncated);
        }
        let mut offset = 4;
        Ok(Self {
            node: take_node_id(data, &mut offset)?,
        })
    }
}

// -- Control-plane dispatch --

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    HelloRequest(HelloPacket),
    HelloResponse(HelloPacket),
    Heartbeat(HeartbeatPacket),
    Advert(AdvertPacket),
    Bye(ByePacket),
}

impl ControlPacket {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let magic: [u8; 4] = [data[0], data[1], data[2], data[3]];
        match magic {
            MAGIC_HELLO_REQ => Ok(Self::HelloRequest(HelloPacket::decode_body(data)?)),
            MAGIC_HELLO_RESP => Ok(Self::HelloResponse(HelloPacket::decode_body(data)?)),
            MAGIC_HEARTBEAT => Ok(Self::Heartbeat(HeartbeatPacket::decode_body(data)?)),
            MAGIC_ADVERT => Ok(Self::Advert(AdvertPacket::decode_body(data)?)),
            MAGIC_BYE => Ok(Self::Bye(ByePacket::decode_body(data)?)),
            _ => Err(DecodeError::BadMagic),
        }
    }
}
