//! Node table snapshots.
//!
//! A [`NodeTable`] is a read-only copy of the cluster view taken between
//! dispatches. Its text form is one line per node, as printed by NODES,
//! followed by a `vars` trailer carrying the cluster-wide epochs:
//!
//! ```text
//! <id> <ip>:<port>@<bus-port> <flags> <master|-> <ping-sent> <pong-recv> <config-epoch> <link> <slots>...
//! vars currentEpoch <n> lastVoteEpoch <n>
//! ```

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::node::{describe_flags, ClusterNode, NodeFlags, NodeRole};
use crate::slots::{SlotRange, SLOT_COUNT};
use crate::NodeId;

/// One node's line in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub bus_port: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    pub master: Option<NodeId>,
    pub ping_sent: u64,
    pub pong_received: u64,
    pub config_epoch: u64,
    pub connected: bool,
    pub slots: Vec<SlotRange>,
}

impl From<&ClusterNode> for NodeRecord {
    fn from(node: &ClusterNode) -> Self {
        Self {
            id: node.id,
            ip: node.ip,
            port: node.port,
            bus_port: node.bus_port,
            role: node.role,
            flags: node.flags,
            master: node.slaveof,
            ping_sent: node.ping_sent,
            pong_received: node.pong_received,
            config_epoch: node.config_epoch,
            connected: node.flags.myself || (node.pong_received != 0 && !node.is_failing()),
            slots: node.slots.ranges(),
        }
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.id.as_str())?;
        if let Some(ip) = self.ip {
            write!(f, "{ip}")?;
        }
        write!(
            f,
            ":{}@{} {} ",
            self.port,
            self.bus_port,
            describe_flags(self.role, self.flags)
        )?;
        match &self.master {
            Some(master) => write!(f, "{} ", master.as_str())?,
            None => f.write_str("- ")?,
        }
        write!(
            f,
            "{} {} {} {}",
            self.ping_sent,
            self.pong_received,
            self.config_epoch,
            if self.connected { "connected" } else { "disconnected" }
        )?;
        for range in &self.slots {
            write!(f, " {range}")?;
        }
        Ok(())
    }
}

impl FromStr for NodeRecord {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(format!("expected at least 8 fields, got {}", fields.len()));
        }
        let id = NodeId::parse(fields[0]).map_err(|e| e.to_string())?;
        let (ip, port, bus_port) = parse_addr(fields[1])?;
        let (role, flags) = parse_flags(fields[2])?;
        let master = match fields[3] {
            "-" => None,
            other => Some(NodeId::parse(other).map_err(|e| e.to_string())?),
        };
        let number = |s: &str, what: &str| -> Result<u64, String> {
            s.parse().map_err(|_| format!("invalid {what} '{s}'"))
        };
        let slots = fields[8..]
            .iter()
            .map(|s| parse_range(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            ip,
            port,
            bus_port,
            role,
            flags,
            master,
            ping_sent: number(fields[4], "ping time")?,
            pong_received: number(fields[5], "pong time")?,
            config_epoch: number(fields[6], "config epoch")?,
            connected: fields[7] == "connected",
            slots,
        })
    }
}

fn parse_addr(s: &str) -> Result<(Option<IpAddr>, u16, u16), String> {
    let (host_port, bus) = s
        .split_once('@')
        .ok_or_else(|| format!("address '{s}' lacks a bus port"))?;
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| format!("address '{s}' lacks a port"))?;
    let ip = if host.is_empty() {
        None
    } else {
        Some(host.parse().map_err(|_| format!("invalid ip '{host}'"))?)
    };
    let port = port.parse().map_err(|_| format!("invalid port '{port}'"))?;
    let bus = bus.parse().map_err(|_| format!("invalid bus port '{bus}'"))?;
    Ok((ip, port, bus))
}

fn parse_flags(s: &str) -> Result<(NodeRole, NodeFlags), String> {
    let mut flags = NodeFlags::default();
    let mut master = false;
    let mut slave = false;
    for flag in s.split(',') {
        match flag {
            "myself" => flags.myself = true,
            "master" => master = true,
            "slave" => slave = true,
            "fail?" => flags.pfail = true,
            "fail" => flags.fail = true,
            "handshake" => flags.handshake = true,
            "noaddr" => flags.noaddr = true,
            "noflags" => {}
            other => return Err(format!("unknown flag '{other}'")),
        }
    }
    match (master, slave) {
        (true, true) => Err("node is both master and slave".into()),
        (_, true) => Ok((NodeRole::Slave, flags)),
        _ => Ok((NodeRole::Master, flags)),
    }
}

fn parse_range(s: &str) -> Result<SlotRange, String> {
    let slot = |v: &str| -> Result<u16, String> {
        match v.parse::<u16>() {
            Ok(n) if n < SLOT_COUNT => Ok(n),
            _ => Err(format!("invalid slot '{v}'")),
        }
    };
    match s.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (slot(start)?, slot(end)?);
            if start > end {
                return Err(format!("inverted slot range '{s}'"));
            }
            Ok(SlotRange::new(start, end))
        }
        None => Ok(SlotRange::single(slot(s)?)),
    }
}

/// A point-in-time copy of every known node plus the cluster epochs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeTable {
    pub nodes: Vec<NodeRecord>,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
}

impl NodeTable {
    pub fn myself(&self) -> Option<&NodeRecord> {
        self.nodes.iter().find(|r| r.flags.myself)
    }
}

impl fmt::Display for NodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.nodes {
            writeln!(f, "{record}")?;
        }
        writeln!(
            f,
            "vars currentEpoch {} lastVoteEpoch {}",
            self.current_epoch, self.last_vote_epoch
        )
    }
}

impl FromStr for NodeTable {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut table = NodeTable::default();
        for (i, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let err = |reason: String| ConfigError::NodeTable {
                line: i + 1,
                reason,
            };
            if let Some(vars) = line.strip_prefix("vars ") {
                let parts: Vec<&str> = vars.split_whitespace().collect();
                for pair in parts.chunks(2) {
                    let [name, value] = pair else {
                        return Err(err("unpaired variable".into()));
                    };
                    let value: u64 = value
                        .parse()
                        .map_err(|_| err(format!("invalid value for {name}")))?;
                    match *name {
                        "currentEpoch" => table.current_epoch = value,
                        "lastVoteEpoch" => table.last_vote_epoch = value,
                        other => return Err(err(format!("unknown variable '{other}'"))),
                    }
                }
                continue;
            }
            table.nodes.push(line.parse().map_err(err)?);
        }
        if table.nodes.iter().filter(|r| r.flags.myself).count() > 1 {
            return Err(ConfigError::NodeTable {
                line: 0,
                reason: "more than one node flagged myself".into(),
            });
        }
        Ok(table)
    }
}

/// Where node table snapshots go when persistent state changes.
pub trait NodeTableStore: Send + 'static {
    fn save(&mut self, table: &NodeTable) -> std::io::Result<()>;
}

/// Discards every snapshot. For nodes that run without a config file.
#[derive(Debug, Default)]
pub struct NoopStore;

impl NodeTableStore for NoopStore {
    fn save(&mut self, _table: &NodeTable) -> std::io::Result<()> {
        Ok(())
    }
}
