//! The set of known nodes and the forget blacklist.
//!
//! The local node is stored apart from its peers so that looking it up
//! can never fail. Back references (slave to master, slot to owner) are
//! ids, re-resolved on every use.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{debug, info};

use crate::error::{CommandError, DuplicateNode};
use crate::node::{ClusterNode, NodeRole};
use crate::slots::SlotTable;
use crate::NodeId;

/// Every node the local node knows about, including itself.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    myself: ClusterNode,
    peers: HashMap<NodeId, ClusterNode>,
}

impl NodeRegistry {
    pub fn new(mut myself: ClusterNode) -> Self {
        myself.flags.myself = true;
        Self {
            myself,
            peers: HashMap::new(),
        }
    }

    pub fn myself_id(&self) -> NodeId {
        self.myself.id
    }

    pub fn myself(&self) -> &ClusterNode {
        &self.myself
    }

    pub fn myself_mut(&mut self) -> &mut ClusterNode {
        &mut self.myself
    }

    pub fn is_myself(&self, id: &NodeId) -> bool {
        self.myself.id == *id
    }

    pub fn lookup(&self, id: &NodeId) -> Option<&ClusterNode> {
        if self.is_myself(id) {
            Some(&self.myself)
        } else {
            self.peers.get(id)
        }
    }

    pub fn lookup_mut(&mut self, id: &NodeId) -> Option<&mut ClusterNode> {
        if self.myself.id == *id {
            Some(&mut self.myself)
        } else {
            self.peers.get_mut(id)
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.is_myself(id) || self.peers.contains_key(id)
    }

    /// Registers a peer. Fails if the id is already present.
    pub fn add(&mut self, node: ClusterNode) -> Result<(), DuplicateNode> {
        if self.contains(&node.id) {
            return Err(DuplicateNode(node.id));
        }
        debug!(node = %node.id, handshake = node.flags.handshake, "node added");
        self.peers.insert(node.id, node);
        Ok(())
    }

    /// Removes a peer, releasing its slots and detaching it from any
    /// master's slave list and any slave's `slaveof`. Unknown ids and the
    /// local node are ignored.
    pub fn remove(&mut self, id: &NodeId, slots: &mut SlotTable) -> Option<ClusterNode> {
        let node = self.peers.remove(id)?;
        slots.release_all(id);
        for other in self.iter_mut() {
            other.remove_slave(id);
            other.fail_reports.retain(|r| r.reporter != *id);
            if other.slaveof == Some(*id) {
                other.slaveof = None;
            }
        }
        info!(node = %id, "node removed");
        Some(node)
    }

    /// Replaces a handshake placeholder id with the peer's real id.
    pub fn rename(&mut self, from: &NodeId, to: NodeId) -> Result<(), DuplicateNode> {
        if self.contains(&to) {
            return Err(DuplicateNode(to));
        }
        if let Some(mut node) = self.peers.remove(from) {
            node.id = to;
            self.peers.insert(to, node);
            debug!(from = %from, to = %to, "node renamed");
        }
        Ok(())
    }

    /// Total known nodes, including myself.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates every node, myself first.
    pub fn iter(&self) -> impl Iterator<Item = &ClusterNode> {
        std::iter::once(&self.myself).chain(self.peers.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClusterNode> {
        std::iter::once(&mut self.myself).chain(self.peers.values_mut())
    }

    /// Iterates every node except myself.
    pub fn peers(&self) -> impl Iterator<Item = &ClusterNode> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut ClusterNode> {
        self.peers.values_mut()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Finds a handshake placeholder for the given address.
    pub fn find_handshake(&self, ip: IpAddr, port: u16) -> Option<NodeId> {
        self.peers
            .values()
            .find(|n| n.flags.handshake && n.ip == Some(ip) && n.port == port)
            .map(|n| n.id)
    }

    /// Finds a completed (non-handshake) node at the given address.
    pub fn find_by_addr(&self, ip: IpAddr, port: u16) -> Option<NodeId> {
        self.iter()
            .find(|n| !n.flags.handshake && n.ip == Some(ip) && n.port == port)
            .map(|n| n.id)
    }

    /// Masters outside handshake, including myself when a master.
    pub fn master_count(&self) -> usize {
        self.iter()
            .filter(|n| n.is_master() && !n.flags.handshake)
            .count()
    }

    /// Makes `master` the local node's master.
    ///
    /// Rejects myself as the target, a slave as the target, and a local
    /// node that is a master still serving slots. Nothing changes on error.
    pub fn set_my_master_to(&mut self, master: &NodeId) -> Result<(), CommandError> {
        if self.is_myself(master) {
            return Err(CommandError::CantReplicateMyself);
        }
        let target = self
            .peers
            .get(master)
            .ok_or_else(|| CommandError::UnknownNode(master.as_str().to_owned()))?;
        if target.is_slave() {
            return Err(CommandError::CantReplicateSlave);
        }
        if self.myself.is_master() && !self.myself.slots.is_empty() {
            return Err(CommandError::NotEmptyMaster);
        }

        let me = self.myself.id;
        if let Some(old) = self.myself.slaveof.take() {
            if let Some(old_master) = self.peers.get_mut(&old) {
                old_master.remove_slave(&me);
            }
        }
        self.myself.role = NodeRole::Slave;
        self.myself.slaveof = Some(*master);
        self.myself.slaves.clear();
        if let Some(new_master) = self.peers.get_mut(master) {
            new_master.add_slave(me);
        }
        info!(master = %master, "replicating new master");
        Ok(())
    }
}

/// Ids of recently forgotten nodes, each with an expiry (unix ms).
///
/// Gossip mentioning a blacklisted id is ignored, so a FORGET is not
/// undone by the next heartbeat from a peer that still knows the node.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: HashMap<NodeId, u64>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklists `id` until `now + ttl`. Re-adding refreshes the expiry.
    pub fn add(&mut self, id: NodeId, ttl: u64, now: u64) {
        self.entries.insert(id, now.saturating_add(ttl));
    }

    pub fn contains(&self, id: &NodeId, now: u64) -> bool {
        self.entries.get(id).is_some_and(|&expiry| expiry > now)
    }

    /// Drops expired entries.
    pub fn cleanup(&mut self, now: u64) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
