//! The cluster view owned by the coordinator.
//!
//! `ClusterState` holds the node registry, the slot table, the epochs and
//! the derived health. It is a plain data structure: the coordinator's
//! dispatch loop is its only writer, so nothing in here locks.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::info;

use crate::config::ClusterConfig;
use crate::error::ConfigError;
use crate::message::MessageType;
use crate::node::ClusterNode;
use crate::registry::{Blacklist, NodeRegistry};
use crate::slots::{SlotTable, SLOT_COUNT};
use crate::table::{NodeRecord, NodeTable};
use crate::NodeId;

/// Overall cluster health as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    /// Every required slot is served and a majority of masters is reachable.
    Ok,
    /// Some required slot has no reachable owner.
    Fail,
    /// Slots are covered but too few slot-serving masters are reachable.
    NeedHelp,
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Ok => f.write_str("ok"),
            ClusterHealth::Fail => f.write_str("fail"),
            ClusterHealth::NeedHelp => f.write_str("needhelp"),
        }
    }
}

/// Bus message counters, per type and direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStats {
    sent: [u64; MessageType::COUNT],
    received: [u64; MessageType::COUNT],
}

impl MessageStats {
    pub fn record_sent(&mut self, kind: MessageType) {
        self.sent[kind as usize] += 1;
    }

    pub fn record_received(&mut self, kind: MessageType) {
        self.received[kind as usize] += 1;
    }

    pub fn sent(&self, kind: MessageType) -> u64 {
        self.sent[kind as usize]
    }

    pub fn received(&self, kind: MessageType) -> u64 {
        self.received[kind as usize]
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().sum()
    }
}

/// The local node's complete view of the cluster.
#[derive(Debug, Clone)]
pub struct ClusterState {
    config: Arc<ClusterConfig>,
    pub nodes: NodeRegistry,
    pub slots: SlotTable,
    pub blacklist: Blacklist,
    /// Never decreases.
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
    pub stats: MessageStats,
    health: ClusterHealth,
    size: usize,
    dirty: bool,
}

impl ClusterState {
    /// Creates a fresh single-node view with a random id.
    pub fn new(config: Arc<ClusterConfig>, now: u64) -> Result<Self, ConfigError> {
        Self::with_id(config, NodeId::random(), now)
    }

    /// Creates a fresh single-node view for the given id.
    pub fn with_id(config: Arc<ClusterConfig>, id: NodeId, now: u64) -> Result<Self, ConfigError> {
        let myself = ClusterNode::new(
            id,
            config.announce_ip,
            config.announce_port,
            config.bus_port()?,
            now,
        );
        let mut state = Self {
            config,
            nodes: NodeRegistry::new(myself),
            slots: SlotTable::new(),
            blacklist: Blacklist::new(),
            current_epoch: 0,
            last_vote_epoch: 0,
            stats: MessageStats::default(),
            health: ClusterHealth::Fail,
            size: 0,
            dirty: false,
        };
        state.update_state();
        Ok(state)
    }

    /// Rebuilds a view from a saved node table.
    ///
    /// The local node keeps the configured address; peers come back
    /// without outstanding pings and with PFAIL cleared, and any peer
    /// that had answered before is treated as having answered now.
    pub fn restore(config: Arc<ClusterConfig>, table: &NodeTable, now: u64) -> Result<Self, ConfigError> {
        let corrupt = |reason: String| ConfigError::NodeTable { line: 0, reason };
        let me = table
            .myself()
            .ok_or_else(|| corrupt("no node flagged myself".into()))?;

        let mut state = Self::with_id(config, me.id, now)?;
        {
            let myself = state.nodes.myself_mut();
            if myself.ip.is_none() {
                myself.ip = me.ip;
                myself.flags.noaddr = me.ip.is_none();
            }
            myself.role = me.role;
            myself.slaveof = me.master;
            myself.config_epoch = me.config_epoch;
        }

        for record in table.nodes.iter().filter(|r| !r.flags.myself && !r.flags.handshake) {
            let mut node = ClusterNode::new(record.id, record.ip, record.port, record.bus_port, now);
            node.role = record.role;
            node.flags.fail = record.flags.fail;
            node.flags.noaddr = record.flags.noaddr || record.ip.is_none();
            node.slaveof = record.master;
            node.config_epoch = record.config_epoch;
            if record.pong_received != 0 {
                node.pong_received = now;
            }
            state
                .nodes
                .add(node)
                .map_err(|e| corrupt(e.to_string()))?;
        }

        for record in &table.nodes {
            for slot in record.slots.iter().flat_map(|r| r.iter()) {
                state.add_slot(slot, record.id);
            }
        }

        let links: Vec<(NodeId, NodeId)> = state
            .nodes
            .iter()
            .filter_map(|n| n.slaveof.map(|m| (m, n.id)))
            .collect();
        for (master, slave) in links {
            if let Some(master) = state.nodes.lookup_mut(&master) {
                master.add_slave(slave);
            }
        }

        let max_config = state.nodes.iter().map(|n| n.config_epoch).max().unwrap_or(0);
        state.current_epoch = table.current_epoch.max(max_config);
        state.last_vote_epoch = table.last_vote_epoch;
        state.dirty = false;
        state.update_state();
        info!(
            myself = %state.nodes.myself_id(),
            nodes = state.nodes.len(),
            epoch = state.current_epoch,
            "node table restored"
        );
        Ok(state)
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    pub fn myself_id(&self) -> NodeId {
        self.nodes.myself_id()
    }

    pub fn myself(&self) -> &ClusterNode {
        self.nodes.myself()
    }

    pub fn health(&self) -> ClusterHealth {
        self.health
    }

    /// Masters serving at least one slot.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Flags that persistent state changed since the last save.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears and returns the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Gives `slot` to `node` in both the table and the node bitmaps.
    /// Returns false if the node is unknown.
    pub fn add_slot(&mut self, slot: u16, node: NodeId) -> bool {
        if slot >= SLOT_COUNT || !self.nodes.contains(&node) {
            return false;
        }
        if let Some(previous) = self.slots.set_owner(slot, node) {
            if let Some(prev) = self.nodes.lookup_mut(&previous) {
                prev.slots.remove(slot);
            }
        }
        if let Some(owner) = self.nodes.lookup_mut(&node) {
            owner.slots.insert(slot);
        }
        self.dirty = true;
        true
    }

    /// Unassigns `slot`, returning its previous owner.
    pub fn del_slot(&mut self, slot: u16) -> Option<NodeId> {
        let previous = self.slots.release(slot)?;
        if let Some(prev) = self.nodes.lookup_mut(&previous) {
            prev.slots.remove(slot);
        }
        self.dirty = true;
        Some(previous)
    }

    /// Removes a peer and every reference to it.
    pub fn del_node(&mut self, id: &NodeId) -> Option<ClusterNode> {
        let removed = self.nodes.remove(id, &mut self.slots)?;
        self.dirty = true;
        Some(removed)
    }

    /// Re-derives health and size. Logs on change.
    pub fn update_state(&mut self) -> ClusterHealth {
        let mut health = ClusterHealth::Ok;

        if self.config.require_full_coverage {
            let uncovered = self.slots.iter().any(|(_, owner)| {
                match owner.and_then(|id| self.nodes.lookup(&id)) {
                    Some(node) => node.flags.fail,
                    None => true,
                }
            });
            if uncovered {
                health = ClusterHealth::Fail;
            }
        }

        let serving = || {
            self.nodes
                .iter()
                .filter(|n| n.is_master() && !n.slots.is_empty())
        };
        let size = serving().count();
        let reachable = serving().filter(|n| !n.is_failing()).count();
        if health == ClusterHealth::Ok && size > 0 && reachable < size / 2 + 1 {
            health = ClusterHealth::NeedHelp;
        }

        self.size = size;
        if health != self.health {
            info!(from = %self.health, to = %health, "cluster state changed");
            self.health = health;
        }
        health
    }

    /// The NODES text: one line per node.
    pub fn nodes_description(&self) -> String {
        let mut out = String::new();
        for node in self.nodes.iter() {
            let _ = writeln!(out, "{}", NodeRecord::from(node));
        }
        out
    }

    /// The NODES line for a single node, newline-terminated.
    pub fn node_description(&self, node: &ClusterNode) -> String {
        format!("{}\n", NodeRecord::from(node))
    }

    /// A snapshot for persistence. Handshake placeholders are left out.
    pub fn snapshot(&self) -> NodeTable {
        NodeTable {
            nodes: self
                .nodes
                .iter()
                .filter(|n| !n.flags.handshake)
                .map(NodeRecord::from)
                .collect(),
            current_epoch: self.current_epoch,
            last_vote_epoch: self.last_vote_epoch,
        }
    }

    /// The INFO text.
    pub fn info(&self) -> String {
        let (mut assigned, mut ok, mut pfail, mut fail) = (0, 0, 0, 0);
        for (_, owner) in self.slots.iter() {
            let Some(node) = owner.and_then(|id| self.nodes.lookup(&id)) else {
                continue;
            };
            assigned += 1;
            if node.flags.fail {
                fail += 1;
            } else if node.flags.pfail {
                pfail += 1;
            } else {
                ok += 1;
            }
        }

        let myself = self.myself();
        let my_epoch = match myself.slaveof.and_then(|m| self.nodes.lookup(&m)) {
            Some(master) if myself.is_slave() => master.config_epoch,
            _ => myself.config_epoch,
        };

        let mut out = String::new();
        let mut line = |key: &str, value: &dyn fmt::Display| {
            let _ = write!(out, "{key}:{value}\r\n");
        };
        line("cluster_state", &self.health);
        line("cluster_slots_assigned", &assigned);
        line("cluster_slots_ok", &ok);
        line("cluster_slots_pfail", &pfail);
        line("cluster_slots_fail", &fail);
        line("cluster_known_nodes", &self.nodes.len());
        line("cluster_size", &self.size);
        line("cluster_current_epoch", &self.current_epoch);
        line("cluster_my_epoch", &my_epoch);

        for kind in MessageType::ALL {
            let n = self.stats.sent(kind);
            if n > 0 {
                line(&format!("cluster_stats_messages_{}_sent", kind.as_str()), &n);
            }
        }
        line("cluster_stats_messages_sent", &self.stats.total_sent());
        for kind in MessageType::ALL {
            let n = self.stats.received(kind);
            if n > 0 {
                line(&format!("cluster_stats_messages_{}_received", kind.as_str()), &n);
            }
        }
        line("cluster_stats_messages_received", &self.stats.total_received());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotRange;

    fn state() -> ClusterState {
        let config = ClusterConfig {
            announce_ip: Some("127.0.0.1".parse().unwrap()),
            announce_port: 7000,
            ..ClusterConfig::default()
        };
        ClusterState::new(Arc::new(config), 1_000).unwrap()
    }

    fn peer(state: &mut ClusterState, port: u16) -> NodeId {
        let node = ClusterNode::new(
            NodeId::random(),
            Some("127.0.0.1".parse().unwrap()),
            port,
            port + 10000,
            1_000,
        );
        let id = node.id;
        state.nodes.add(node).unwrap();
        id
    }

    #[test]
    fn fresh_node_fails_full_coverage() {
        let state = state();
        assert_eq!(state.health(), ClusterHealth::Fail);
        assert_eq!(state.size(), 0);
    }

    #[test]
    fn full_coverage_gives_ok() {
        let mut state = state();
        let me = state.myself_id();
        for slot in 0..SLOT_COUNT {
            state.add_slot(slot, me);
        }
        assert_eq!(state.update_state(), ClusterHealth::Ok);
        assert_eq!(state.size(), 1);
        assert_eq!(state.myself().slots.count(), SLOT_COUNT as usize);
    }

    #[test]
    fn failed_owner_breaks_coverage() {
        let mut state = state();
        let me = state.myself_id();
        let other = peer(&mut state, 7001);
        for slot in 0..8192 {
            state.add_slot(slot, me);
        }
        for slot in 8192..SLOT_COUNT {
            state.add_slot(slot, other);
        }
        assert_eq!(state.update_state(), ClusterHealth::Ok);
        state.nodes.lookup_mut(&other).unwrap().flags.fail = true;
        assert_eq!(state.update_state(), ClusterHealth::Fail);
    }

    #[test]
    fn minority_without_full_coverage_needs_help() {
        let config = ClusterConfig {
            require_full_coverage: false,
            ..ClusterConfig::default()
        };
        let mut state = ClusterState::new(Arc::new(config), 0).unwrap();
        assert_eq!(state.update_state(), ClusterHealth::Ok);

        let me = state.myself_id();
        let a = peer(&mut state, 7001);
        let b = peer(&mut state, 7002);
        state.add_slot(0, me);
        state.add_slot(1, a);
        state.add_slot(2, b);
        assert_eq!(state.update_state(), ClusterHealth::Ok);
        state.nodes.lookup_mut(&a).unwrap().flags.pfail = true;
        state.nodes.lookup_mut(&b).unwrap().flags.fail = true;
        assert_eq!(state.update_state(), ClusterHealth::NeedHelp);
        assert_eq!(state.size(), 3);
    }

    #[test]
    fn add_slot_moves_bitmap_bits() {
        let mut state = state();
        let me = state.myself_id();
        let other = peer(&mut state, 7001);
        assert!(state.add_slot(5, me));
        assert!(state.add_slot(5, other));
        assert!(!state.myself().slots.contains(5));
        assert!(state.nodes.lookup(&other).unwrap().slots.contains(5));
        assert_eq!(state.del_slot(5), Some(other));
        assert!(state.nodes.lookup(&other).unwrap().slots.is_empty());
        assert!(!state.add_slot(6, NodeId::random()));
        assert!(state.take_dirty());
        assert!(!state.take_dirty());
    }

    #[test]
    fn info_reports_counters() {
        let mut state = state();
        let me = state.myself_id();
        state.add_slot(0, me);
        state.current_epoch = 4;
        state.stats.record_sent(MessageType::Ping);
        state.stats.record_sent(MessageType::Ping);
        state.stats.record_received(MessageType::Pong);
        let info = state.info();
        assert!(info.starts_with("cluster_state:fail\r\n"));
        assert!(info.contains("cluster_slots_assigned:1\r\n"));
        assert!(info.contains("cluster_known_nodes:1\r\n"));
        assert!(info.contains("cluster_current_epoch:4\r\n"));
        assert!(info.contains("cluster_stats_messages_ping_sent:2\r\n"));
        assert!(info.contains("cluster_stats_messages_sent:2\r\n"));
        assert!(info.contains("cluster_stats_messages_pong_received:1\r\n"));
        assert!(!info.contains("meet_sent"));
    }

    #[test]
    fn snapshot_restores_the_view() {
        let mut state = state();
        let me = state.myself_id();
        let master = peer(&mut state, 7001);
        let slave = peer(&mut state, 7002);
        for slot in 0..100 {
            state.add_slot(slot, me);
        }
        state.add_slot(200, master);
        {
            let node = state.nodes.lookup_mut(&slave).unwrap();
            node.role = crate::NodeRole::Slave;
            node.slaveof = Some(master);
        }
        state.nodes.myself_mut().config_epoch = 3;
        state.current_epoch = 7;
        let handshake = ClusterNode::handshake("10.0.0.9".parse().unwrap(), 7009, 17009, true, 0);
        state.nodes.add(handshake).unwrap();

        let table = state.snapshot();
        assert_eq!(table.nodes.len(), 3);
        let text = table.to_string();
        let parsed: NodeTable = text.parse().unwrap();

        let restored = ClusterState::restore(state.config().clone(), &parsed, 5_000).unwrap();
        assert_eq!(restored.myself_id(), me);
        assert_eq!(restored.current_epoch, 7);
        assert_eq!(restored.myself().config_epoch, 3);
        assert_eq!(restored.slots.count_owned_by(&me), 100);
        assert_eq!(restored.slots.owner_of(200), Some(master));
        assert_eq!(
            restored.myself().slots.ranges(),
            vec![SlotRange::new(0, 99)]
        );
        assert_eq!(restored.nodes.lookup(&master).unwrap().slaves, vec![slave]);
        assert!(!restored.is_dirty());
    }

    #[test]
    fn restore_requires_myself() {
        let config = Arc::new(ClusterConfig::default());
        assert!(ClusterState::restore(config, &NodeTable::default(), 0).is_err());
    }
}
