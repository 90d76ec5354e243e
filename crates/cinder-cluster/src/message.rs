//! Binary wire format for cluster bus messages.
//!
//! Every message starts with the sender's header (identity, address,
//! flags, epochs and claimed slots), followed by a type-specific body.
//! All multi-byte integers are little-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::node::{decode_flags, encode_flags, NodeFlags, NodeRole, NODE_ID_LEN};
use crate::slots::{SlotBitmap, SLOT_BITMAP_BYTES};
use crate::NodeId;

/// Maximum gossip sections in one message.
/// Prevents allocation bombs from crafted messages.
pub const MAX_GOSSIP_SECTIONS: usize = 1024;

/// Maximum length of a PUBLISH channel or payload.
const MAX_PUBLISH_LEN: usize = 512 * 1024;

const IP_NONE: u8 = 0;
const IP_V4: u8 = 4;
const IP_V6: u8 = 6;

// Safe read helpers that fail instead of panicking on truncated input.

fn safe_get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8], what: &'static str) -> Result<u16, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u32_le(buf: &mut &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn safe_get_u64_le(buf: &mut &[u8], what: &'static str) -> Result<u64, ProtocolError> {
    if buf.len() < 8 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u64_le())
}

fn safe_take<'a>(buf: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < len {
        return Err(ProtocolError::Truncated(what));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Bus message types. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    Update = 5,
}

impl MessageType {
    pub const COUNT: usize = 6;

    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Meet,
        MessageType::Fail,
        MessageType::Publish,
        MessageType::Update,
    ];

    /// Name used in INFO counters.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Meet => "meet",
            MessageType::Fail => "fail",
            MessageType::Publish => "publish",
            MessageType::Update => "update",
        }
    }

    fn from_wire(tag: u16) -> Result<Self, ProtocolError> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(ProtocolError::UnknownType(tag))
    }
}

/// The sender's self-description, carried by every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderHeader {
    pub id: NodeId,
    /// Announced ip; receivers fall back to the connection's peer ip.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub bus_port: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    /// For a slave, its master's config epoch.
    pub config_epoch: u64,
    pub current_epoch: u64,
    pub slaveof: Option<NodeId>,
    /// For a slave, its master's slots.
    pub slots: SlotBitmap,
}

/// What the sender knows about a third node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipSection {
    pub id: NodeId,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub bus_port: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    pub ping_sent: u64,
    pub pong_received: u64,
}

/// Type-specific message contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Ping(Vec<GossipSection>),
    Pong(Vec<GossipSection>),
    Meet(Vec<GossipSection>),
    /// The sender has declared `node` FAIL.
    Fail { node: NodeId },
    Publish { channel: Bytes, message: Bytes },
    /// `node` serves `slots` at `config_epoch`; sent to peers holding a
    /// stale claim.
    Update {
        node: NodeId,
        config_epoch: u64,
        slots: SlotBitmap,
    },
}

/// A complete bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub sender: SenderHeader,
    pub body: MessageBody,
}

impl BusMessage {
    pub fn kind(&self) -> MessageType {
        match self.body {
            MessageBody::Ping(_) => MessageType::Ping,
            MessageBody::Pong(_) => MessageType::Pong,
            MessageBody::Meet(_) => MessageType::Meet,
            MessageBody::Fail { .. } => MessageType::Fail,
            MessageBody::Publish { .. } => MessageType::Publish,
            MessageBody::Update { .. } => MessageType::Update,
        }
    }

    /// The gossip sections of a PING, PONG or MEET.
    pub fn gossip(&self) -> &[GossipSection] {
        match &self.body {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => g,
            _ => &[],
        }
    }

    /// Serializes the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2200 + self.gossip().len() * 120);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.kind() as u16);
        encode_header(buf, &self.sender);
        match &self.body {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => {
                debug_assert!(g.len() <= MAX_GOSSIP_SECTIONS);
                buf.put_u16_le(g.len() as u16);
                for section in g {
                    encode_section(buf, section);
                }
            }
            MessageBody::Fail { node } => buf.put_slice(node.as_bytes()),
            MessageBody::Publish { channel, message } => {
                buf.put_u32_le(channel.len() as u32);
                buf.put_slice(channel);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message);
            }
            MessageBody::Update {
                node,
                config_epoch,
                slots,
            } => {
                buf.put_slice(node.as_bytes());
                buf.put_u64_le(*config_epoch);
                buf.put_slice(&slots.to_bytes());
            }
        }
    }

    /// Parses a message. The whole buffer must be consumed.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let kind = MessageType::from_wire(safe_get_u16_le(&mut buf, "message type")?)?;
        let sender = decode_header(&mut buf)?;
        let body = match kind {
            MessageType::Ping => MessageBody::Ping(decode_sections(&mut buf)?),
            MessageType::Pong => MessageBody::Pong(decode_sections(&mut buf)?),
            MessageType::Meet => MessageBody::Meet(decode_sections(&mut buf)?),
            MessageType::Fail => MessageBody::Fail {
                node: decode_node_id(&mut buf, "failing node id")?,
            },
            MessageType::Publish => {
                let channel = decode_blob(&mut buf, "publish channel")?;
                let message = decode_blob(&mut buf, "publish message")?;
                MessageBody::Publish { channel, message }
            }
            MessageType::Update => MessageBody::Update {
                node: decode_node_id(&mut buf, "update node id")?,
                config_epoch: safe_get_u64_le(&mut buf, "update config epoch")?,
                slots: decode_bitmap(&mut buf)?,
            },
        };
        if !buf.is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "{} trailing bytes",
                buf.len()
            )));
        }
        Ok(Self { sender, body })
    }
}

fn encode_header(buf: &mut BytesMut, h: &SenderHeader) {
    buf.put_slice(h.id.as_bytes());
    encode_ip(buf, h.ip);
    buf.put_u16_le(h.port);
    buf.put_u16_le(h.bus_port);
    buf.put_u16_le(encode_flags(h.role, h.flags));
    buf.put_u64_le(h.config_epoch);
    buf.put_u64_le(h.current_epoch);
    match &h.slaveof {
        Some(master) => {
            buf.put_u8(1);
            buf.put_slice(master.as_bytes());
        }
        None => buf.put_u8(0),
    }
    buf.put_slice(&h.slots.to_bytes());
}

fn decode_header(buf: &mut &[u8]) -> Result<SenderHeader, ProtocolError> {
    let id = decode_node_id(buf, "sender id")?;
    let ip = decode_ip(buf)?;
    let port = safe_get_u16_le(buf, "sender port")?;
    let bus_port = safe_get_u16_le(buf, "sender bus port")?;
    let (role, flags) = decode_flags(safe_get_u16_le(buf, "sender flags")?)?;
    let config_epoch = safe_get_u64_le(buf, "config epoch")?;
    let current_epoch = safe_get_u64_le(buf, "current epoch")?;
    let slaveof = match safe_get_u8(buf, "slaveof marker")? {
        0 => None,
        1 => Some(decode_node_id(buf, "slaveof id")?),
        other => {
            return Err(ProtocolError::Invalid(format!("slaveof marker {other}")));
        }
    };
    let slots = decode_bitmap(buf)?;
    Ok(SenderHeader {
        id,
        ip,
        port,
        bus_port,
        role,
        flags,
        config_epoch,
        current_epoch,
        slaveof,
        slots,
    })
}

fn encode_section(buf: &mut BytesMut, g: &GossipSection) {
    buf.put_slice(g.id.as_bytes());
    encode_ip(buf, g.ip);
    buf.put_u16_le(g.port);
    buf.put_u16_le(g.bus_port);
    buf.put_u16_le(encode_flags(g.role, g.flags));
    buf.put_u64_le(g.ping_sent);
    buf.put_u64_le(g.pong_received);
}

fn decode_sections(buf: &mut &[u8]) -> Result<Vec<GossipSection>, ProtocolError> {
    let count = safe_get_u16_le(buf, "gossip count")? as usize;
    if count > MAX_GOSSIP_SECTIONS {
        return Err(ProtocolError::Invalid(format!(
            "gossip count {count} exceeds {MAX_GOSSIP_SECTIONS}"
        )));
    }
    let mut sections = Vec::with_capacity(count);
    for _ in 0..count {
        let id = decode_node_id(buf, "gossip id")?;
        let ip = decode_ip(buf)?;
        let port = safe_get_u16_le(buf, "gossip port")?;
        let bus_port = safe_get_u16_le(buf, "gossip bus port")?;
        let (role, flags) = decode_flags(safe_get_u16_le(buf, "gossip flags")?)?;
        let ping_sent = safe_get_u64_le(buf, "gossip ping time")?;
        let pong_received = safe_get_u64_le(buf, "gossip pong time")?;
        sections.push(GossipSection {
            id,
            ip,
            port,
            bus_port,
            role,
            flags,
            ping_sent,
            pong_received,
        });
    }
    Ok(sections)
}

fn decode_node_id(buf: &mut &[u8], what: &'static str) -> Result<NodeId, ProtocolError> {
    let raw = safe_take(buf, NODE_ID_LEN, what)?;
    let raw: &[u8; NODE_ID_LEN] = raw
        .try_into()
        .map_err(|_| ProtocolError::Truncated(what))?;
    Ok(NodeId::from_bytes(raw)?)
}

fn decode_bitmap(buf: &mut &[u8]) -> Result<SlotBitmap, ProtocolError> {
    let raw = safe_take(buf, SLOT_BITMAP_BYTES, "slot bitmap")?;
    let raw: &[u8; SLOT_BITMAP_BYTES] = raw
        .try_into()
        .map_err(|_| ProtocolError::Truncated("slot bitmap"))?;
    Ok(SlotBitmap::from_bytes(raw))
}

fn decode_blob(buf: &mut &[u8], what: &'static str) -> Result<Bytes, ProtocolError> {
    let len = safe_get_u32_le(buf, what)? as usize;
    if len > MAX_PUBLISH_LEN {
        return Err(ProtocolError::Invalid(format!("{what} of {len} bytes")));
    }
    Ok(Bytes::copy_from_slice(safe_take(buf, len, what)?))
}

fn encode_ip(buf: &mut BytesMut, ip: Option<IpAddr>) {
    match ip {
        None => buf.put_u8(IP_NONE),
        Some(IpAddr::V4(v4)) => {
            buf.put_u8(IP_V4);
            buf.put_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            buf.put_u8(IP_V6);
            buf.put_slice(&v6.octets());
        }
    }
}

fn decode_ip(buf: &mut &[u8]) -> Result<Option<IpAddr>, ProtocolError> {
    match safe_get_u8(buf, "ip tag")? {
        IP_NONE => Ok(None),
        IP_V4 => {
            let raw = safe_take(buf, 4, "ipv4 address")?;
            Ok(Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))))
        }
        IP_V6 => {
            let raw = safe_take(buf, 16, "ipv6 address")?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ok(Some(IpAddr::V6(Ipv6Addr::from(octets))))
        }
        other => Err(ProtocolError::Invalid(format!("ip tag {other}"))),
    }
}
