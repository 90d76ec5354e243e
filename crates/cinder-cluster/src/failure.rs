//! Failure detection.
//!
//! Each peer moves through OK → PFAIL → FAIL. PFAIL is local suspicion:
//! a ping has gone unanswered for longer than the node timeout, and it
//! clears on the next pong. FAIL needs agreement: more than half of the
//! known masters must have reported the node as PFAIL or FAIL within the
//! last two node timeouts. Once FAIL is declared it is broadcast, and
//! receivers trust the assertion without recounting. FAIL only clears
//! when the node comes back with a higher config epoch, or is forgotten.

use tracing::{debug, info, warn};

use crate::node::{ClusterNode, FailReport};
use crate::state::ClusterState;
use crate::NodeId;

impl ClusterNode {
    /// Adds or refreshes a report. Returns true if the reporter is new.
    fn add_failure_report(&mut self, reporter: NodeId, now: u64) -> bool {
        if let Some(report) = self.fail_reports.iter_mut().find(|r| r.reporter == reporter) {
            report.time = now;
            return false;
        }
        self.fail_reports.push(FailReport {
            reporter,
            time: now,
        });
        true
    }

    fn del_failure_report(&mut self, reporter: &NodeId) -> bool {
        let before = self.fail_reports.len();
        self.fail_reports.retain(|r| r.reporter != *reporter);
        self.fail_reports.len() != before
    }

    /// Drops reports older than `validity` ms.
    fn clean_failure_reports(&mut self, now: u64, validity: u64) {
        self.fail_reports
            .retain(|r| now.saturating_sub(r.time) <= validity);
    }
}

impl ClusterState {
    /// Records that master `reporter` sees `failing` as PFAIL or FAIL.
    pub fn add_failure_report(&mut self, failing: &NodeId, reporter: &NodeId, now: u64) -> bool {
        match self.nodes.lookup_mut(failing) {
            Some(node) => node.add_failure_report(*reporter, now),
            None => false,
        }
    }

    /// Withdraws `reporter`'s report against `failing`, if any.
    pub fn del_failure_report(&mut self, failing: &NodeId, reporter: &NodeId) -> bool {
        let removed = self
            .nodes
            .lookup_mut(failing)
            .is_some_and(|node| node.del_failure_report(reporter));
        if removed {
            debug!(node = %failing, reporter = %reporter, "failure report withdrawn");
        }
        removed
    }

    /// Number of unexpired reports against `id`. Expired ones are dropped.
    pub fn failure_report_count(&mut self, id: &NodeId, now: u64) -> usize {
        let validity = self.config().fail_report_validity_ms();
        match self.nodes.lookup_mut(id) {
            Some(node) => {
                node.clean_failure_reports(now, validity);
                node.fail_reports.len()
            }
            None => 0,
        }
    }

    /// Promotes `id` from PFAIL to FAIL if a majority of masters agree.
    ///
    /// My own suspicion counts as one report when I am a master. Returns
    /// true if the node was just marked FAIL; the caller broadcasts it.
    pub fn mark_node_as_failing_if_needed(&mut self, id: &NodeId, now: u64) -> bool {
        if self.nodes.is_myself(id) {
            return false;
        }
        match self.nodes.lookup(id) {
            Some(node) if node.flags.pfail && !node.flags.fail => {}
            _ => return false,
        }

        let masters = self.nodes.master_count();
        let mut failures = self.failure_report_count(id, now);
        if self.myself().is_master() {
            failures += 1;
        }
        if failures * 2 <= masters {
            return false;
        }

        if let Some(node) = self.nodes.lookup_mut(id) {
            node.flags.pfail = false;
            node.flags.fail = true;
            node.fail_time = now;
        }
        self.mark_dirty();
        warn!(node = %id, failures, masters, "marking node as failing, quorum reached");
        true
    }

    /// Suspects every peer whose outstanding ping has gone unanswered
    /// for longer than the node timeout. Returns the newly suspected ids.
    pub fn check_node_timeouts(&mut self, now: u64) -> Vec<NodeId> {
        let timeout = self.config().node_timeout;
        let mut suspected = Vec::new();
        for node in self.nodes.peers_mut() {
            if node.flags.handshake || node.is_failing() || node.ping_sent == 0 {
                continue;
            }
            let last_heard = node.pong_received.max(node.ctime);
            if now.saturating_sub(last_heard) > timeout {
                node.flags.pfail = true;
                suspected.push(node.id);
            }
        }
        for id in &suspected {
            debug!(node = %id, "node timed out, possibly failing");
        }
        suspected
    }

    /// Records a pong from `id`. Clears PFAIL but never FAIL.
    pub fn record_pong(&mut self, id: &NodeId, now: u64) -> bool {
        let Some(node) = self.nodes.lookup_mut(id) else {
            return false;
        };
        node.pong_received = now;
        node.ping_sent = 0;
        if node.flags.pfail {
            node.flags.pfail = false;
            info!(node = %id, "node is reachable again");
            return true;
        }
        false
    }

    /// Applies a FAIL assertion relayed by a known peer.
    pub fn apply_fail_assertion(&mut self, failing: &NodeId, now: u64) -> bool {
        if self.nodes.is_myself(failing) {
            return false;
        }
        let Some(node) = self.nodes.lookup_mut(failing) else {
            return false;
        };
        if node.flags.fail {
            return false;
        }
        node.flags.fail = true;
        node.flags.pfail = false;
        node.fail_time = now;
        self.mark_dirty();
        warn!(node = %failing, "FAIL message received about node");
        true
    }

    /// Clears FAIL on a node that came back with a newer configuration.
    pub fn clear_node_failure(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.nodes.lookup_mut(id) else {
            return false;
        };
        if !node.flags.fail {
            return false;
        }
        node.flags.fail = false;
        node.fail_reports.clear();
        self.mark_dirty();
        info!(node = %id, "clear FAIL state, node is back with a newer config");
        true
    }
}
