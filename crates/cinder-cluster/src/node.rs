//! Node identity and the per-node descriptor.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use rand::RngCore;

use crate::error::{InvalidNodeId, ProtocolError};
use crate::slots::SlotBitmap;

/// Length of a node id in hex characters.
pub const NODE_ID_LEN: usize = 40;

/// Unique identifier for a cluster node: 40 lowercase hex characters.
///
/// Ids compare lexicographically, which is what the epoch-war tie-break
/// relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Generates a new random node id from 20 random bytes.
    pub fn random() -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut raw = [0u8; NODE_ID_LEN / 2];
        rand::rng().fill_bytes(&mut raw);
        let mut id = [0u8; NODE_ID_LEN];
        for (i, byte) in raw.iter().enumerate() {
            id[i * 2] = HEX[(byte >> 4) as usize];
            id[i * 2 + 1] = HEX[(byte & 0x0f) as usize];
        }
        Self(id)
    }

    /// Parses a node id, accepting upper- or lowercase hex.
    pub fn parse(s: &str) -> Result<Self, InvalidNodeId> {
        let bytes = s.as_bytes();
        let raw: &[u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| InvalidNodeId)?;
        Self::from_bytes(raw)
    }

    /// Builds an id from its 40 wire bytes.
    pub fn from_bytes(raw: &[u8; NODE_ID_LEN]) -> Result<Self, InvalidNodeId> {
        let mut id = [0u8; NODE_ID_LEN];
        for (out, &b) in id.iter_mut().zip(raw.iter()) {
            if !b.is_ascii_hexdigit() {
                return Err(InvalidNodeId);
            }
            *out = b.to_ascii_lowercase();
        }
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// The full 40-character id.
    pub fn as_str(&self) -> &str {
        // only ascii hex digits are ever stored
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form for logs, like a git hash
        f.write_str(&self.as_str()[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

/// The role of a node. Exactly one of MASTER or SLAVE is ever set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRole {
    #[default]
    Master,
    Slave,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Slave => f.write_str("slave"),
        }
    }
}

/// Wire bits for node flags.
pub mod flag_bits {
    pub const MYSELF: u16 = 1;
    pub const MASTER: u16 = 1 << 1;
    pub const SLAVE: u16 = 1 << 2;
    pub const PFAIL: u16 = 1 << 3;
    pub const FAIL: u16 = 1 << 4;
    pub const HANDSHAKE: u16 = 1 << 5;
    pub const NOADDR: u16 = 1 << 6;
    pub const MEET: u16 = 1 << 7;
}

/// Status flags for a node, apart from its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// The local node.
    pub myself: bool,
    /// Suspected failing by the local node.
    pub pfail: bool,
    /// Confirmed failing by the cluster.
    pub fail: bool,
    /// First contact not yet completed.
    pub handshake: bool,
    /// Address not yet known.
    pub noaddr: bool,
    /// Send MEET rather than PING on first contact.
    pub meet: bool,
}

impl NodeFlags {
    /// Returns true if the node is neither suspected nor failed.
    pub fn is_healthy(&self) -> bool {
        !self.fail && !self.pfail
    }
}

/// Packs a role and flags into the wire bitmask.
pub fn encode_flags(role: NodeRole, flags: NodeFlags) -> u16 {
    use flag_bits::*;
    let mut bits = match role {
        NodeRole::Master => MASTER,
        NodeRole::Slave => SLAVE,
    };
    for (set, bit) in [
        (flags.myself, MYSELF),
        (flags.pfail, PFAIL),
        (flags.fail, FAIL),
        (flags.handshake, HANDSHAKE),
        (flags.noaddr, NOADDR),
        (flags.meet, MEET),
    ] {
        if set {
            bits |= bit;
        }
    }
    bits
}

/// Unpacks the wire bitmask. Both MASTER and SLAVE set is malformed;
/// neither set reads as a master.
pub fn decode_flags(bits: u16) -> Result<(NodeRole, NodeFlags), ProtocolError> {
    use flag_bits::*;
    let role = match (bits & MASTER != 0, bits & SLAVE != 0) {
        (true, true) => {
            return Err(ProtocolError::Invalid("both master and slave flags".into()));
        }
        (_, true) => NodeRole::Slave,
        _ => NodeRole::Master,
    };
    let flags = NodeFlags {
        myself: bits & MYSELF != 0,
        pfail: bits & PFAIL != 0,
        fail: bits & FAIL != 0,
        handshake: bits & HANDSHAKE != 0,
        noaddr: bits & NOADDR != 0,
        meet: bits & MEET != 0,
    };
    Ok((role, flags))
}

/// Renders role and flags the way NODES output does:
/// `myself,master,fail?,handshake`.
pub fn describe_flags(role: NodeRole, flags: NodeFlags) -> String {
    let mut parts = Vec::with_capacity(4);
    if flags.myself {
        parts.push("myself");
    }
    parts.push(match role {
        NodeRole::Master => "master",
        NodeRole::Slave => "slave",
    });
    if flags.pfail {
        parts.push("fail?");
    }
    if flags.fail {
        parts.push("fail");
    }
    if flags.handshake {
        parts.push("handshake");
    }
    if flags.noaddr {
        parts.push("noaddr");
    }
    parts.join(",")
}

/// One node's claim that another node is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailReport {
    pub reporter: NodeId,
    /// When the report was last refreshed (unix ms).
    pub time: u64,
}

/// Everything the local node knows about one cluster member.
///
/// Timestamps are unix milliseconds; 0 means "never".
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: NodeId,
    pub ip: Option<IpAddr>,
    /// Client port.
    pub port: u16,
    /// Cluster bus port.
    pub bus_port: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    /// Never decreases.
    pub config_epoch: u64,
    /// Slots this node serves, mirrored from the slot table.
    pub slots: SlotBitmap,
    /// The master's id when this node is a slave.
    pub slaveof: Option<NodeId>,
    /// Ids of this node's slaves when it is a master.
    pub slaves: Vec<NodeId>,
    /// When this descriptor was created.
    pub ctime: u64,
    /// When the outstanding ping was sent; 0 when none is outstanding.
    pub ping_sent: u64,
    pub pong_received: u64,
    /// When FAIL was set.
    pub fail_time: u64,
    pub fail_reports: Vec<FailReport>,
}

impl ClusterNode {
    /// Creates a master descriptor with no slots.
    pub fn new(id: NodeId, ip: Option<IpAddr>, port: u16, bus_port: u16, now: u64) -> Self {
        Self {
            id,
            ip,
            port,
            bus_port,
            role: NodeRole::Master,
            flags: NodeFlags {
                noaddr: ip.is_none(),
                ..NodeFlags::default()
            },
            config_epoch: 0,
            slots: SlotBitmap::new(),
            slaveof: None,
            slaves: Vec::new(),
            ctime: now,
            ping_sent: 0,
            pong_received: 0,
            fail_time: 0,
            fail_reports: Vec::new(),
        }
    }

    /// Creates a placeholder for a node being met: random id, HANDSHAKE set.
    pub fn handshake(ip: IpAddr, port: u16, bus_port: u16, meet: bool, now: u64) -> Self {
        let mut node = Self::new(NodeId::random(), Some(ip), port, bus_port, now);
        node.flags.handshake = true;
        node.flags.meet = meet;
        node
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_slave(&self) -> bool {
        self.role == NodeRole::Slave
    }

    /// True when the node is suspected or confirmed failing.
    pub fn is_failing(&self) -> bool {
        self.flags.pfail || self.flags.fail
    }

    /// The address the cluster bus reaches this node on.
    pub fn bus_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.bus_port))
    }

    /// Wire flag bits for this node.
    pub fn wire_flags(&self) -> u16 {
        encode_flags(self.role, self.flags)
    }

    /// Flag text as shown by NODES.
    pub fn flags_description(&self) -> String {
        describe_flags(self.role, self.flags)
    }

    /// Raises the config epoch. Lower values are ignored.
    pub fn advance_config_epoch(&mut self, epoch: u64) -> bool {
        if epoch > self.config_epoch {
            self.config_epoch = epoch;
            true
        } else {
            false
        }
    }

    pub(crate) fn add_slave(&mut self, slave: NodeId) {
        if !self.slaves.contains(&slave) {
            self.slaves.push(slave);
        }
    }

    pub(crate) fn remove_slave(&mut self, slave: &NodeId) -> bool {
        let before = self.slaves.len();
        self.slaves.retain(|s| s != slave);
        self.slaves.len() != before
    }
}
