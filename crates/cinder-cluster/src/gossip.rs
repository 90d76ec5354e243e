//! Heartbeat gossip over the cluster bus.
//!
//! # Protocol Overview
//!
//! Every cron tick:
//! 1. Drop handshakes that never completed, and (re)send MEET or PING to
//!    the ones still pending
//! 2. Every 10th tick, ping the node with the oldest pong out of a small
//!    random sample
//! 3. Ping any node whose last pong is older than half the node timeout
//! 4. Suspect (PFAIL) nodes whose pings went unanswered too long
//!
//! Every PING, PONG and MEET carries the sender's header and a few gossip
//! sections describing other nodes. Receivers use the header to reconcile
//! epochs, roles and slot claims, and the sections to learn new nodes
//! and collect failure reports.
//!
//! The engine never touches the network: it returns [`Outbound`]
//! messages for the caller to hand to a transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rand::prelude::IndexedRandom;
use tracing::{debug, info, trace, warn};

use crate::config::ClusterConfig;
use crate::error::CommandError;
use crate::message::{
    BusMessage, GossipSection, MessageBody, MessageType, SenderHeader, MAX_GOSSIP_SECTIONS,
};
use crate::node::{ClusterNode, NodeRole};
use crate::slots::{SlotBitmap, SlotClaim};
use crate::state::ClusterState;
use crate::NodeId;

/// Ticks between random-sample pings.
const SAMPLE_EVERY: u64 = 10;

/// A handshake that got no answer is retried after this many ms.
const HANDSHAKE_RETRY_MS: u64 = 1_000;

/// A message to send, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub message: BusMessage,
}

/// Drives heartbeats and merges what peers tell us.
#[derive(Debug)]
pub struct GossipEngine {
    config: Arc<ClusterConfig>,
    tick_count: u64,
}

impl GossipEngine {
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self {
            config,
            tick_count: 0,
        }
    }

    /// Starts meeting the node at `ip:port`.
    ///
    /// Creates a HANDSHAKE placeholder with a random id; the next tick
    /// sends it a MEET. Returns `Ok(false)` if the address is already
    /// known or mid-handshake.
    pub fn start_handshake(
        &self,
        state: &mut ClusterState,
        ip: IpAddr,
        port: u16,
        bus_port: u16,
        now: u64,
    ) -> Result<bool, CommandError> {
        if ip.is_unspecified() || ip.is_multicast() || port == 0 || bus_port == 0 {
            return Err(CommandError::InvalidAddress(format!("{ip}:{port}")));
        }
        if state.nodes.find_handshake(ip, port).is_some()
            || state.nodes.find_by_addr(ip, port).is_some()
        {
            debug!(%ip, port, "handshake skipped, address already known");
            return Ok(false);
        }
        let node = ClusterNode::handshake(ip, port, bus_port, true, now);
        info!(%ip, port, bus_port, placeholder = %node.id, "starting handshake");
        // a fresh random id cannot collide
        let _ = state.nodes.add(node);
        Ok(true)
    }

    /// The local node's header as peers should see it.
    ///
    /// A slave advertises its master's config epoch and slots.
    pub fn header(&self, state: &ClusterState) -> SenderHeader {
        let myself = state.myself();
        let master = myself
            .slaveof
            .filter(|_| myself.is_slave())
            .and_then(|m| state.nodes.lookup(&m));
        let (config_epoch, slots) = match master {
            Some(master) => (master.config_epoch, master.slots.clone()),
            None => (myself.config_epoch, myself.slots.clone()),
        };
        SenderHeader {
            id: myself.id,
            ip: myself.ip,
            port: myself.port,
            bus_port: myself.bus_port,
            role: myself.role,
            flags: myself.flags,
            config_epoch,
            current_epoch: state.current_epoch,
            slaveof: myself.slaveof,
            slots,
        }
    }

    /// Picks the gossip sections for one heartbeat.
    ///
    /// Every suspected node goes first so reports spread quickly, then a
    /// random max(3, known/10) healthy nodes, never more than known - 2.
    /// The total stays within what a receiver will decode.
    fn gossip_sections(&self, state: &ClusterState) -> Vec<GossipSection> {
        let known = state.nodes.len();
        let wanted = (known / 10).max(3).min(known.saturating_sub(2));
        let eligible = |n: &&ClusterNode| !n.flags.handshake && !n.flags.noaddr;

        let mut sections: Vec<GossipSection> = state
            .nodes
            .peers()
            .filter(eligible)
            .filter(|n| n.flags.pfail)
            .take(MAX_GOSSIP_SECTIONS)
            .map(section_for)
            .collect();

        let room = wanted.min(MAX_GOSSIP_SECTIONS - sections.len());
        let healthy: Vec<&ClusterNode> = state
            .nodes
            .peers()
            .filter(eligible)
            .filter(|n| !n.flags.pfail)
            .collect();
        sections.extend(
            healthy
                .choose_multiple(&mut rand::rng(), room)
                .map(|n| section_for(n)),
        );
        sections
    }

    /// Builds a PING, PONG or MEET.
    pub fn heartbeat(&self, state: &ClusterState, kind: MessageType) -> BusMessage {
        let gossip = self.gossip_sections(state);
        let body = match kind {
            MessageType::Pong => MessageBody::Pong(gossip),
            MessageType::Meet => MessageBody::Meet(gossip),
            _ => MessageBody::Ping(gossip),
        };
        BusMessage {
            sender: self.header(state),
            body,
        }
    }

    /// Sends a heartbeat to `target`, recording the ping time for PING
    /// and MEET.
    fn ping(
        &self,
        state: &mut ClusterState,
        target: NodeId,
        kind: MessageType,
        now: u64,
    ) -> Option<Outbound> {
        let node = state.nodes.lookup(&target)?;
        let addr = node.bus_addr()?;
        let handshake = node.flags.handshake;
        let message = self.heartbeat(state, kind);
        if kind != MessageType::Pong {
            if let Some(node) = state.nodes.lookup_mut(&target) {
                if node.ping_sent == 0 || handshake {
                    node.ping_sent = now;
                }
            }
        }
        trace!(node = %target, kind = kind.as_str(), "heartbeat");
        Some(Outbound { addr, message })
    }

    /// Addresses of every reachable, non-handshake peer.
    fn broadcast_targets(state: &ClusterState) -> Vec<SocketAddr> {
        state
            .nodes
            .peers()
            .filter(|n| !n.flags.handshake)
            .filter_map(ClusterNode::bus_addr)
            .collect()
    }

    /// A PONG to every peer, announcing a config change at once.
    pub fn broadcast_pong(&self, state: &ClusterState) -> Vec<Outbound> {
        let message = self.heartbeat(state, MessageType::Pong);
        Self::broadcast_targets(state)
            .into_iter()
            .map(|addr| Outbound {
                addr,
                message: message.clone(),
            })
            .collect()
    }

    /// A FAIL assertion about `failing` to every peer.
    pub fn broadcast_fail(&self, state: &ClusterState, failing: NodeId) -> Vec<Outbound> {
        let message = BusMessage {
            sender: self.header(state),
            body: MessageBody::Fail { node: failing },
        };
        Self::broadcast_targets(state)
            .into_iter()
            .map(|addr| Outbound {
                addr,
                message: message.clone(),
            })
            .collect()
    }

    /// Tells a peer holding a stale slot claim who owns those slots now.
    fn update_message(&self, state: &ClusterState, owner: &NodeId) -> Option<BusMessage> {
        let node = state.nodes.lookup(owner)?;
        Some(BusMessage {
            sender: self.header(state),
            body: MessageBody::Update {
                node: node.id,
                config_epoch: node.config_epoch,
                slots: node.slots.clone(),
            },
        })
    }

    /// Runs one cron period.
    pub fn tick(&mut self, state: &mut ClusterState, now: u64) -> Vec<Outbound> {
        self.tick_count += 1;
        let mut out = Vec::new();

        // handshakes: prune the stale ones, (re)contact the rest
        let handshake_timeout = self.config.handshake_timeout_ms();
        let (stale, pending): (Vec<&ClusterNode>, Vec<&ClusterNode>) = state
            .nodes
            .peers()
            .filter(|n| n.flags.handshake)
            .partition(|n| now.saturating_sub(n.ctime) > handshake_timeout);
        let stale: Vec<NodeId> = stale.into_iter().map(|n| n.id).collect();
        let pending: Vec<(NodeId, bool)> = pending
            .into_iter()
            .filter(|n| n.ping_sent == 0 || now.saturating_sub(n.ping_sent) >= HANDSHAKE_RETRY_MS)
            .map(|n| (n.id, n.flags.meet))
            .collect();
        for id in stale {
            info!(node = %id, "handshake timed out, removing node");
            state.del_node(&id);
        }
        for (id, meet) in pending {
            let kind = if meet {
                MessageType::Meet
            } else {
                MessageType::Ping
            };
            out.extend(self.ping(state, id, kind, now));
        }

        // every few ticks, ping the least recently heard of a random sample
        if self.tick_count % SAMPLE_EVERY == 0 {
            let candidates: Vec<&ClusterNode> = state
                .nodes
                .peers()
                .filter(|n| !n.flags.handshake && n.ping_sent == 0 && n.ip.is_some())
                .collect();
            let target = candidates
                .choose_multiple(&mut rand::rng(), self.config.ping_sample_size)
                .min_by_key(|n| n.pong_received)
                .map(|n| n.id);
            if let Some(target) = target {
                out.extend(self.ping(state, target, MessageType::Ping, now));
            }
        }

        // anyone we have not heard from in half a timeout
        let half_timeout = self.config.node_timeout / 2;
        let overdue: Vec<NodeId> = state
            .nodes
            .peers()
            .filter(|n| {
                !n.flags.handshake
                    && n.ping_sent == 0
                    && now.saturating_sub(n.pong_received) > half_timeout
            })
            .map(|n| n.id)
            .collect();
        for id in overdue {
            out.extend(self.ping(state, id, MessageType::Ping, now));
        }

        // unanswered pings are re-sent now and then, keeping the original
        // send time, so a healed partition is noticed
        if self.tick_count % SAMPLE_EVERY == 0 {
            let unanswered: Vec<NodeId> = state
                .nodes
                .peers()
                .filter(|n| {
                    !n.flags.handshake
                        && n.ping_sent != 0
                        && now.saturating_sub(n.ping_sent) > half_timeout
                })
                .map(|n| n.id)
                .collect();
            for id in unanswered {
                out.extend(self.ping(state, id, MessageType::Ping, now));
            }
        }

        for id in state.check_node_timeouts(now) {
            if state.mark_node_as_failing_if_needed(&id, now) {
                out.extend(self.broadcast_fail(state, id));
            }
        }

        state.blacklist.cleanup(now);
        state.update_state();
        out
    }

    /// Processes one inbound message. `peer` is the address the message
    /// arrived from; it stands in for a sender that announces no ip.
    pub fn handle_message(
        &mut self,
        state: &mut ClusterState,
        peer: SocketAddr,
        msg: BusMessage,
        now: u64,
    ) -> Vec<Outbound> {
        let kind = msg.kind();
        state.stats.record_received(kind);
        let mut out = Vec::new();

        let hdr = &msg.sender;
        if state.nodes.is_myself(&hdr.id) {
            trace!("ignoring message from myself");
            return out;
        }
        let sender_ip = hdr.ip.unwrap_or(peer.ip());
        let reply_addr = SocketAddr::new(sender_ip, hdr.bus_port);
        let is_heartbeat = matches!(
            kind,
            MessageType::Ping | MessageType::Pong | MessageType::Meet
        );

        // epochs first, so a stale claim never wins a slot
        if is_known(state, &hdr.id) {
            state.reconcile_epoch(hdr.current_epoch);
        }

        if kind == MessageType::Meet && !state.nodes.contains(&hdr.id) {
            self.accept_meet(state, hdr, sender_ip, now);
        }
        if kind == MessageType::Pong {
            self.complete_handshake(state, hdr, sender_ip);
        }
        if matches!(kind, MessageType::Ping | MessageType::Meet) {
            out.push(Outbound {
                addr: reply_addr,
                message: self.heartbeat(state, MessageType::Pong),
            });
        }

        if !is_known(state, &hdr.id) {
            trace!(sender = %hdr.id, kind = kind.as_str(), "message from unknown sender");
            return out;
        }
        let sender = hdr.id;

        match &msg.body {
            MessageBody::Fail { node } => {
                state.apply_fail_assertion(node, now);
                return out;
            }
            MessageBody::Update {
                node,
                config_epoch,
                slots,
            } => {
                self.apply_update(state, *node, *config_epoch, slots);
                return out;
            }
            MessageBody::Publish { channel, .. } => {
                trace!(sender = %sender, channel = channel.len(), "publish received");
                return out;
            }
            _ => {}
        }

        if kind == MessageType::Pong {
            state.record_pong(&sender, now);
        }

        let (recorded_epoch, failed) = match state.nodes.lookup(&sender) {
            Some(node) => (node.config_epoch, node.flags.fail),
            None => return out,
        };
        if failed && hdr.config_epoch > recorded_epoch {
            state.clear_node_failure(&sender);
        }
        if is_heartbeat {
            update_address(state, &sender, sender_ip, hdr.port, hdr.bus_port);
        }

        let stale = hdr.role == NodeRole::Master && hdr.config_epoch < recorded_epoch;
        if stale {
            debug!(sender = %sender, epoch = hdr.config_epoch, "ignoring stale config");
        } else {
            apply_role(state, &sender, hdr.role, hdr.slaveof);
            if hdr.role == NodeRole::Master {
                state.update_node_config_epoch(&sender, hdr.config_epoch);
                self.reconcile_slots(
                    state,
                    sender,
                    hdr.config_epoch,
                    &hdr.slots,
                    Some(reply_addr),
                    &mut out,
                );
            }
        }

        if hdr.role == NodeRole::Master
            && state.myself().is_master()
            && hdr.config_epoch == state.myself().config_epoch
            && state.handle_config_epoch_collision(&sender)
        {
            out.extend(self.broadcast_pong(state));
        }

        if is_heartbeat {
            self.merge_gossip(state, sender, msg.gossip(), now, &mut out);
        }
        out
    }

    /// An unknown node met us: remember it in HANDSHAKE under its own id
    /// until it answers one of our pings.
    fn accept_meet(&self, state: &mut ClusterState, hdr: &SenderHeader, ip: IpAddr, now: u64) {
        if state.nodes.find_handshake(ip, hdr.port).is_some()
            || state.nodes.find_by_addr(ip, hdr.port).is_some()
        {
            return;
        }
        let mut node = ClusterNode::new(hdr.id, Some(ip), hdr.port, hdr.bus_port, now);
        node.flags.handshake = true;
        node.role = hdr.role;
        info!(node = %hdr.id, %ip, port = hdr.port, "MEET received from unknown node");
        let _ = state.nodes.add(node);
    }

    /// A PONG from a node we are meeting: give the placeholder its real
    /// id, or drop it if that id is already known.
    fn complete_handshake(&self, state: &mut ClusterState, hdr: &SenderHeader, ip: IpAddr) {
        let pending = match state.nodes.lookup(&hdr.id) {
            Some(node) if node.flags.handshake => Some(hdr.id),
            Some(_) => {
                if let Some(placeholder) = state.nodes.find_handshake(ip, hdr.port) {
                    debug!(node = %hdr.id, "handshake with already known node, dropping placeholder");
                    state.del_node(&placeholder);
                }
                None
            }
            None => {
                let placeholder = state.nodes.find_handshake(ip, hdr.port);
                if let Some(placeholder) = placeholder {
                    if state.nodes.rename(&placeholder, hdr.id).is_err() {
                        return;
                    }
                }
                placeholder.map(|_| hdr.id)
            }
        };
        let Some(id) = pending else {
            return;
        };
        if let Some(node) = state.nodes.lookup_mut(&id) {
            node.flags.handshake = false;
            node.flags.meet = false;
            node.ping_sent = 0;
            node.role = hdr.role;
        }
        state.mark_dirty();
        info!(node = %id, %ip, port = hdr.port, "handshake completed");
    }

    /// Offers every slot a master sender claims to the slot table.
    ///
    /// Claims beaten by a higher-epoch owner get an UPDATE back. Ties go
    /// to the smaller node id; the epoch collision check that follows
    /// moves the loser to a new epoch.
    fn reconcile_slots(
        &self,
        state: &mut ClusterState,
        sender: NodeId,
        epoch: u64,
        claimed: &SlotBitmap,
        reply_addr: Option<SocketAddr>,
        out: &mut Vec<Outbound>,
    ) {
        let myself = state.myself_id();
        let mut newer_owners: Vec<NodeId> = Vec::new();
        let mut lost = 0usize;
        let mut changed = false;

        for slot in claimed.iter() {
            let nodes = &state.nodes;
            let claim = state.slots.assign(slot, sender, epoch, |owner| {
                nodes.lookup(owner).map_or(0, |n| n.config_epoch)
            });
            let previous = match claim {
                SlotClaim::Unchanged => continue,
                SlotClaim::Rejected { owner } => {
                    if !newer_owners.contains(&owner) {
                        newer_owners.push(owner);
                    }
                    continue;
                }
                SlotClaim::Conflict { owner } if sender < owner => {
                    state.slots.set_owner(slot, sender);
                    Some(owner)
                }
                SlotClaim::Conflict { .. } => continue,
                SlotClaim::Assigned { previous } => previous,
            };
            if let Some(prev) = previous {
                if let Some(node) = state.nodes.lookup_mut(&prev) {
                    node.slots.remove(slot);
                }
                if prev == myself {
                    lost += 1;
                }
            }
            if let Some(node) = state.nodes.lookup_mut(&sender) {
                node.slots.insert(slot);
            }
            changed = true;
        }

        if lost > 0 {
            warn!(sender = %sender, epoch, slots = lost, "lost slots to a newer claim");
        }
        if changed {
            state.mark_dirty();
        }
        let Some(addr) = reply_addr else {
            return;
        };
        for owner in newer_owners {
            debug!(sender = %sender, owner = %owner, "sender has a stale slot claim, sending UPDATE");
            if let Some(message) = self.update_message(state, &owner) {
                out.push(Outbound { addr, message });
            }
        }
    }

    /// Applies an UPDATE: `node` serves `slots` at `config_epoch`.
    fn apply_update(&self, state: &mut ClusterState, node: NodeId, config_epoch: u64, slots: &SlotBitmap) {
        if state.nodes.is_myself(&node) {
            return;
        }
        let recorded = match state.nodes.lookup(&node) {
            Some(n) => n.config_epoch,
            None => return,
        };
        if config_epoch <= recorded {
            return;
        }
        info!(node = %node, epoch = config_epoch, "UPDATE received, adopting newer slot config");
        state.update_node_config_epoch(&node, config_epoch);
        self.reconcile_slots(state, node, config_epoch, slots, None, &mut Vec::new());
    }

    /// Merges gossip sections from a known sender.
    fn merge_gossip(
        &self,
        state: &mut ClusterState,
        sender: NodeId,
        sections: &[GossipSection],
        now: u64,
        out: &mut Vec<Outbound>,
    ) {
        let sender_is_master = state
            .nodes
            .lookup(&sender)
            .is_some_and(ClusterNode::is_master);

        for g in sections {
            if state.nodes.is_myself(&g.id) {
                continue;
            }
            if let Some(node) = state.nodes.lookup(&g.id) {
                let fill_addr = node.flags.noaddr && !g.flags.noaddr && g.ip.is_some();
                if sender_is_master && !node.flags.handshake {
                    if g.flags.pfail || g.flags.fail {
                        if state.add_failure_report(&g.id, &sender, now) {
                            debug!(node = %g.id, reporter = %sender, "node reported as failing");
                        }
                        if state.mark_node_as_failing_if_needed(&g.id, now) {
                            out.extend(self.broadcast_fail(state, g.id));
                        }
                    } else {
                        state.del_failure_report(&g.id, &sender);
                    }
                }
                if fill_addr {
                    if let Some(node) = state.nodes.lookup_mut(&g.id) {
                        node.ip = g.ip;
                        node.port = g.port;
                        node.bus_port = g.bus_port;
                        node.flags.noaddr = false;
                    }
                    state.mark_dirty();
                }
                continue;
            }

            if g.flags.noaddr || g.flags.handshake || state.blacklist.contains(&g.id, now) {
                continue;
            }
            let Some(ip) = g.ip else {
                continue;
            };
            if state.nodes.find_handshake(ip, g.port).is_some()
                || state.nodes.find_by_addr(ip, g.port).is_some()
            {
                continue;
            }
            let mut node = ClusterNode::new(g.id, Some(ip), g.port, g.bus_port, now);
            node.flags.handshake = true;
            info!(node = %g.id, %ip, port = g.port, via = %sender, "discovered node through gossip");
            let _ = state.nodes.add(node);
        }
    }
}

/// True for a registered node whose handshake has completed.
fn is_known(state: &ClusterState, id: &NodeId) -> bool {
    state
        .nodes
        .lookup(id)
        .is_some_and(|n| !n.flags.handshake)
}

fn section_for(node: &ClusterNode) -> GossipSection {
    GossipSection {
        id: node.id,
        ip: node.ip,
        port: node.port,
        bus_port: node.bus_port,
        role: node.role,
        flags: node.flags,
        ping_sent: node.ping_sent,
        pong_received: node.pong_received,
    }
}

/// Records a changed address from the node itself, unless another node
/// already holds it.
fn update_address(state: &mut ClusterState, id: &NodeId, ip: IpAddr, port: u16, bus_port: u16) {
    let Some(node) = state.nodes.lookup(id) else {
        return;
    };
    if node.ip == Some(ip) && node.port == port && node.bus_port == bus_port {
        return;
    }
    if let Some(other) = state.nodes.find_by_addr(ip, port) {
        if other != *id {
            debug!(node = %id, holder = %other, %ip, port, "address conflict, not updating");
            return;
        }
    }
    if let Some(node) = state.nodes.lookup_mut(id) {
        node.ip = Some(ip);
        node.port = port;
        node.bus_port = bus_port;
        node.flags.noaddr = false;
    }
    state.mark_dirty();
    info!(node = %id, %ip, port, "node address updated");
}

/// Applies a role change announced by the node itself, keeping slave
/// lists consistent on both sides.
fn apply_role(state: &mut ClusterState, id: &NodeId, role: NodeRole, slaveof: Option<NodeId>) {
    let Some(node) = state.nodes.lookup(id) else {
        return;
    };
    let (was_master, old_master) = (node.is_master(), node.slaveof);

    match role {
        NodeRole::Master => {
            if was_master {
                return;
            }
            if let Some(node) = state.nodes.lookup_mut(id) {
                node.role = NodeRole::Master;
                node.slaveof = None;
            }
            if let Some(old) = old_master.and_then(|m| state.nodes.lookup_mut(&m)) {
                old.remove_slave(id);
            }
            info!(node = %id, "slave promoted to master");
        }
        NodeRole::Slave => {
            if was_master {
                let released = state.slots.release_all(id);
                if let Some(node) = state.nodes.lookup_mut(id) {
                    node.role = NodeRole::Slave;
                    node.slots.clear();
                }
                info!(node = %id, released, "master demoted to slave");
            } else if old_master == slaveof {
                return;
            }
            if old_master != slaveof {
                if let Some(old) = old_master.and_then(|m| state.nodes.lookup_mut(&m)) {
                    old.remove_slave(id);
                }
                if let Some(new) = slaveof.and_then(|m| state.nodes.lookup_mut(&m)) {
                    new.add_slave(*id);
                }
                if let Some(node) = state.nodes.lookup_mut(id) {
                    node.slaveof = slaveof;
                }
            }
        }
    }
    state.mark_dirty();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeFlags;

    struct Peer {
        state: ClusterState,
        gossip: GossipEngine,
    }

    impl Peer {
        /// Ids grow with the port, so lower ports win epoch collisions.
        fn new(port: u16) -> Self {
            Self::with_id(port, NodeId::parse(&format!("{port:040x}")).unwrap())
        }

        fn with_id(port: u16, id: NodeId) -> Self {
            let config = Arc::new(ClusterConfig {
                announce_ip: Some("127.0.0.1".parse().unwrap()),
                announce_port: port,
                node_timeout: 1_000,
                ..ClusterConfig::default()
            });
            Self {
                state: ClusterState::with_id(config.clone(), id, 0).unwrap(),
                gossip: GossipEngine::new(config),
            }
        }

        fn id(&self) -> NodeId {
            self.state.myself_id()
        }

        fn bus_addr(&self) -> SocketAddr {
            self.state.myself().bus_addr().unwrap()
        }

        fn receive(&mut self, from: &Peer, msg: BusMessage, now: u64) -> Vec<Outbound> {
            self.gossip
                .handle_message(&mut self.state, from.bus_addr(), msg, now)
        }

        /// Registers `other` as a fully known master.
        fn know(&mut self, other: &Peer) {
            let me = other.state.myself();
            let mut node = ClusterNode::new(me.id, me.ip, me.port, me.bus_port, 0);
            node.config_epoch = me.config_epoch;
            node.pong_received = 1;
            self.state.nodes.add(node).unwrap();
        }

        fn ping(&self) -> BusMessage {
            self.gossip.heartbeat(&self.state, MessageType::Ping)
        }
    }

    fn only_to(out: &[Outbound], addr: SocketAddr) -> Vec<&BusMessage> {
        out.iter()
            .filter(|o| o.addr == addr)
            .map(|o| &o.message)
            .collect()
    }

    #[test]
    fn start_handshake_validates_address() {
        let mut a = Peer::new(7000);
        let gossip = &a.gossip;
        let err = gossip
            .start_handshake(&mut a.state, "0.0.0.0".parse().unwrap(), 7001, 17001, 0)
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidAddress(_)));
        assert!(gossip
            .start_handshake(&mut a.state, "127.0.0.1".parse().unwrap(), 0, 10000, 0)
            .is_err());

        let ip = "127.0.0.1".parse().unwrap();
        assert_eq!(gossip.start_handshake(&mut a.state, ip, 7001, 17001, 0), Ok(true));
        assert_eq!(gossip.start_handshake(&mut a.state, ip, 7001, 17001, 0), Ok(false));
        // my own address is already known
        assert_eq!(gossip.start_handshake(&mut a.state, ip, 7000, 17000, 0), Ok(false));
        assert_eq!(a.state.nodes.len(), 2);
    }

    #[test]
    fn meet_handshake_completes_on_both_sides() {
        let mut a = Peer::new(7000);
        let mut b = Peer::new(7001);
        let ip = "127.0.0.1".parse().unwrap();
        a.gossip.start_handshake(&mut a.state, ip, 7001, 17001, 0).unwrap();

        // a's tick sends MEET
        let out = a.gossip.tick(&mut a.state, 10);
        let meets = only_to(&out, b.bus_addr());
        assert_eq!(meets.len(), 1);
        assert_eq!(meets[0].kind(), MessageType::Meet);

        // b answers with PONG and remembers a in handshake
        let out = b.receive(&a, meets[0].clone(), 20);
        let pongs = only_to(&out, a.bus_addr());
        assert_eq!(pongs[0].kind(), MessageType::Pong);
        assert!(b.state.nodes.lookup(&a.id()).unwrap().flags.handshake);

        // the PONG gives a's placeholder its real id
        a.receive(&b, pongs[0].clone(), 30);
        let node = a.state.nodes.lookup(&b.id()).unwrap();
        assert!(!node.flags.handshake);
        assert_eq!(node.pong_received, 30);
        assert_eq!(a.state.nodes.len(), 2);

        // b pings a back and completes its side
        let out = b.gossip.tick(&mut b.state, 40);
        let pings = only_to(&out, a.bus_addr());
        assert_eq!(pings[0].kind(), MessageType::Ping);
        let out = a.receive(&b, pings[0].clone(), 50);
        b.receive(&a, only_to(&out, b.bus_addr())[0].clone(), 60);
        assert!(!b.state.nodes.lookup(&a.id()).unwrap().flags.handshake);
        assert!(b.state.take_dirty());
    }

    #[test]
    fn stale_handshakes_are_pruned() {
        let mut a = Peer::new(7000);
        let ip = "127.0.0.1".parse().unwrap();
        a.gossip.start_handshake(&mut a.state, ip, 7001, 17001, 0).unwrap();
        a.gossip.tick(&mut a.state, 500);
        assert_eq!(a.state.nodes.len(), 2);
        // handshake timeout is max(node timeout, 1s)
        a.gossip.tick(&mut a.state, 1_001);
        assert_eq!(a.state.nodes.len(), 1);
    }

    #[test]
    fn gossip_discovers_unknown_nodes() {
        let mut a = Peer::new(7000);
        let mut b = Peer::new(7001);
        let c = Peer::new(7002);
        b.know(&a);
        a.know(&b);
        a.know(&c);

        let mut msg = a.ping();
        msg.body = MessageBody::Ping(vec![section_for(a.state.nodes.lookup(&c.id()).unwrap())]);
        b.receive(&a, msg, 10);

        let node = b.state.nodes.lookup(&c.id()).unwrap();
        assert!(node.flags.handshake);
        assert_eq!(node.port, 7002);
    }

    #[test]
    fn blacklisted_nodes_are_not_relearned() {
        let mut a = Peer::new(7000);
        let mut b = Peer::new(7001);
        let c = Peer::new(7002);
        b.know(&a);
        a.know(&c);
        b.state.blacklist.add(c.id(), 60_000, 0);

        let mut msg = a.ping();
        msg.body = MessageBody::Ping(vec![section_for(a.state.nodes.lookup(&c.id()).unwrap())]);
        b.receive(&a, msg.clone(), 10);
        assert!(!b.state.nodes.contains(&c.id()));

        // once the entry expires the node is learned again
        b.receive(&a, msg, 60_001);
        assert!(b.state.nodes.contains(&c.id()));
    }

    #[test]
    fn failure_reports_reach_quorum_and_broadcast_fail() {
        // three masters: me, a, and the failing x
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let x = Peer::new(7002);
        me.know(&a);
        me.know(&x);
        me.state.nodes.lookup_mut(&x.id()).unwrap().flags.pfail = true;

        let mut report = section_for(me.state.nodes.lookup(&x.id()).unwrap());
        report.flags = NodeFlags {
            pfail: true,
            ..NodeFlags::default()
        };
        let mut msg = a.ping();
        msg.body = MessageBody::Ping(vec![report]);
        let out = me.receive(&a, msg, 10);

        assert!(me.state.nodes.lookup(&x.id()).unwrap().flags.fail);
        let fails: Vec<_> = out
            .iter()
            .filter(|o| o.message.kind() == MessageType::Fail)
            .collect();
        assert_eq!(fails.len(), 2);
        assert_eq!(me.state.failure_report_count(&x.id(), 10), 1);
    }

    #[test]
    fn slave_reports_do_not_count() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let x = Peer::new(7002);
        me.know(&a);
        me.know(&x);
        me.state.nodes.lookup_mut(&a.id()).unwrap().role = NodeRole::Slave;

        let mut report = section_for(me.state.nodes.lookup(&x.id()).unwrap());
        report.flags.pfail = true;
        let mut msg = a.ping();
        msg.sender.role = NodeRole::Slave;
        msg.sender.slaveof = Some(x.id());
        msg.body = MessageBody::Ping(vec![report]);
        me.receive(&a, msg, 10);
        assert_eq!(me.state.failure_report_count(&x.id(), 10), 0);
    }

    #[test]
    fn fail_message_is_trusted() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let x = Peer::new(7002);
        me.know(&a);
        me.know(&x);
        let msg = BusMessage {
            sender: a.gossip.header(&a.state),
            body: MessageBody::Fail { node: x.id() },
        };
        me.receive(&a, msg, 10);
        assert!(me.state.nodes.lookup(&x.id()).unwrap().flags.fail);
    }

    #[test]
    fn fail_from_unknown_sender_is_ignored() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let x = Peer::new(7002);
        me.know(&x);
        let msg = BusMessage {
            sender: a.gossip.header(&a.state),
            body: MessageBody::Fail { node: x.id() },
        };
        me.receive(&a, msg, 10);
        assert!(!me.state.nodes.lookup(&x.id()).unwrap().flags.fail);
    }

    #[test]
    fn higher_epoch_clears_fail() {
        let mut me = Peer::new(7000);
        let mut a = Peer::new(7001);
        me.know(&a);
        me.state.apply_fail_assertion(&a.id(), 5);

        // same epoch: still failed
        me.receive(&a, a.ping(), 10);
        assert!(me.state.nodes.lookup(&a.id()).unwrap().flags.fail);

        a.state.bump_epoch_without_consensus();
        me.receive(&a, a.ping(), 20);
        let node = me.state.nodes.lookup(&a.id()).unwrap();
        assert!(!node.flags.fail);
        assert_eq!(node.config_epoch, 1);
        assert_eq!(me.state.current_epoch, 1);
    }

    #[test]
    fn epochs_reconcile_from_known_senders_only() {
        let mut me = Peer::new(7000);
        let stranger = Peer::new(7001);
        let mut msg = stranger.ping();
        msg.sender.current_epoch = 9;
        me.receive(&stranger, msg.clone(), 10);
        assert_eq!(me.state.current_epoch, 0);

        me.know(&stranger);
        me.receive(&stranger, msg, 20);
        assert_eq!(me.state.current_epoch, 9);
    }

    #[test]
    fn higher_epoch_claim_takes_slots() {
        let mut me = Peer::new(7000);
        let mut a = Peer::new(7001);
        me.know(&a);
        let my_id = me.id();
        for slot in 0..10 {
            me.state.add_slot(slot, my_id);
        }
        me.state.nodes.myself_mut().config_epoch = 1;

        for slot in 5..15 {
            let id = a.id();
            a.state.add_slot(slot, id);
        }
        a.state.nodes.myself_mut().config_epoch = 2;
        a.state.current_epoch = 2;

        me.receive(&a, a.ping(), 10);
        assert_eq!(me.state.slots.owner_of(4), Some(my_id));
        assert_eq!(me.state.slots.owner_of(5), Some(a.id()));
        assert_eq!(me.state.slots.owner_of(14), Some(a.id()));
        assert_eq!(me.state.myself().slots.count(), 5);
        assert_eq!(
            me.state.nodes.lookup(&a.id()).unwrap().slots.count(),
            10
        );
    }

    #[test]
    fn lower_epoch_claim_gets_update() {
        let mut me = Peer::new(7000);
        let mut a = Peer::new(7001);
        me.know(&a);
        a.know(&me);
        let my_id = me.id();
        me.state.add_slot(3, my_id);
        me.state.nodes.myself_mut().config_epoch = 5;

        let id = a.id();
        a.state.add_slot(3, id);
        a.state.nodes.myself_mut().config_epoch = 1;

        let out = me.receive(&a, a.ping(), 10);
        assert_eq!(me.state.slots.owner_of(3), Some(my_id));
        let updates = only_to(&out, a.bus_addr())
            .into_iter()
            .filter(|m| m.kind() == MessageType::Update)
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(updates.len(), 1);

        // the UPDATE moves the slot on a's side
        a.receive(&me, updates[0].clone(), 20);
        assert_eq!(a.state.slots.owner_of(3), Some(my_id));
        assert!(a.state.myself().slots.is_empty());
    }

    #[test]
    fn equal_epoch_conflict_goes_to_smaller_id() {
        let low = NodeId::parse(&"1".repeat(40)).unwrap();
        let high = NodeId::parse(&"9".repeat(40)).unwrap();
        let mut me = Peer::with_id(7000, high);
        let mut a = Peer::with_id(7001, low);
        me.know(&a);

        me.state.add_slot(7, high);
        me.state.nodes.myself_mut().config_epoch = 3;
        me.state.current_epoch = 3;
        a.state.add_slot(7, low);
        a.state.nodes.myself_mut().config_epoch = 3;
        a.state.current_epoch = 3;
        me.state.nodes.lookup_mut(&low).unwrap().config_epoch = 3;

        let out = me.receive(&a, a.ping(), 10);
        assert_eq!(me.state.slots.owner_of(7), Some(low));
        // the greater id moved to a new epoch and announced it
        assert_eq!(me.state.myself().config_epoch, 4);
        assert_eq!(me.state.current_epoch, 4);
        assert!(out.iter().any(|o| o.message.kind() == MessageType::Pong));
    }

    #[test]
    fn stale_header_does_not_regress_role() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let b = Peer::new(7002);
        me.know(&a);
        me.know(&b);
        me.state.nodes.lookup_mut(&a.id()).unwrap().config_epoch = 5;

        let mut msg = a.ping();
        msg.sender.config_epoch = 2;
        msg.sender.slots = [1].into_iter().collect();
        me.receive(&a, msg, 10);
        assert_eq!(me.state.slots.owner_of(1), None);
        assert_eq!(me.state.nodes.lookup(&a.id()).unwrap().config_epoch, 5);

        // a slave announcement is applied, with the slave lists
        let mut msg = a.ping();
        msg.sender.role = NodeRole::Slave;
        msg.sender.slaveof = Some(b.id());
        me.receive(&a, msg, 20);
        assert!(me.state.nodes.lookup(&a.id()).unwrap().is_slave());
        assert_eq!(me.state.nodes.lookup(&b.id()).unwrap().slaves, vec![a.id()]);
    }

    #[test]
    fn tick_pings_overdue_nodes_and_suspects_silent_ones() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        me.know(&a);

        let out = me.gossip.tick(&mut me.state, 1_000);
        assert_eq!(only_to(&out, a.bus_addr()).len(), 1);
        assert_eq!(me.state.nodes.lookup(&a.id()).unwrap().ping_sent, 1_000);

        // ping outstanding: not re-sent
        let out = me.gossip.tick(&mut me.state, 1_001);
        assert!(only_to(&out, a.bus_addr()).is_empty());

        // one timeout after the last pong is not yet enough
        assert!(!me.state.nodes.lookup(&a.id()).unwrap().flags.pfail);
        me.gossip.tick(&mut me.state, 1_002);
        assert!(me.state.nodes.lookup(&a.id()).unwrap().flags.pfail);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mut me = Peer::new(7000);
        let a = Peer::new(7001);
        let out = me.receive(&a, a.ping(), 10);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addr, a.bus_addr());
        assert_eq!(out[0].message.kind(), MessageType::Pong);
        assert_eq!(me.state.stats.received(MessageType::Ping), 1);
    }

    #[test]
    fn gossip_section_count_is_bounded() {
        let mut me = Peer::new(7000);
        for port in 7001..7031 {
            let p = Peer::new(port);
            me.know(&p);
        }
        // 31 known nodes: max(3, 3) sections, capped at 29
        assert_eq!(me.ping().gossip().len(), 3);

        let ids = me.state.nodes.peer_ids();
        for id in &ids[..4] {
            me.state.nodes.lookup_mut(id).unwrap().flags.pfail = true;
        }
        // suspected nodes always ride along
        let sections = me.ping();
        let pfail = sections.gossip().iter().filter(|g| g.flags.pfail).count();
        assert_eq!(pfail, 4);
        assert_eq!(sections.gossip().len(), 7);
    }

    #[test]
    fn mass_suspicion_still_fits_one_heartbeat() {
        let mut me = Peer::new(7000);
        let ip = Some("127.0.0.1".parse().unwrap());
        for i in 0..1100u16 {
            let mut node = ClusterNode::new(NodeId::random(), ip, 20000 + i, 40000 + i, 0);
            node.flags.pfail = i < 1050;
            me.state.nodes.add(node).unwrap();
        }

        let ping = me.ping();
        let sections = ping.gossip();
        assert_eq!(sections.len(), MAX_GOSSIP_SECTIONS);
        // suspects take every slot before healthy nodes get one
        assert!(sections.iter().all(|g| g.flags.pfail));

        let decoded = BusMessage::decode(&ping.encode()).unwrap();
        assert_eq!(decoded.gossip().len(), MAX_GOSSIP_SECTIONS);
    }
}
