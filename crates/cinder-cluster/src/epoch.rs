//! Epoch management.
//!
//! `current_epoch` is the cluster-wide logical clock and only moves
//! forward. Each node's `config_epoch` versions its slot claims: a higher
//! config epoch wins a slot. When two masters end up with the same config
//! epoch, the one with the greater id bumps itself past the current epoch
//! so every master eventually holds a unique config epoch.

use tracing::{info, warn};

use crate::error::CommandError;
use crate::state::ClusterState;
use crate::NodeId;

impl ClusterState {
    /// Raises the current epoch to `sender_epoch` if it is ahead.
    pub fn reconcile_epoch(&mut self, sender_epoch: u64) -> bool {
        if sender_epoch > self.current_epoch {
            self.current_epoch = sender_epoch;
            self.mark_dirty();
            true
        } else {
            false
        }
    }

    /// Largest config epoch of any known node, myself included.
    pub fn max_config_epoch(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.config_epoch)
            .max()
            .unwrap_or(0)
    }

    /// Records a node's config epoch. Never lowers it.
    pub fn update_node_config_epoch(&mut self, id: &NodeId, epoch: u64) -> bool {
        let advanced = self
            .nodes
            .lookup_mut(id)
            .is_some_and(|node| node.advance_config_epoch(epoch));
        if advanced {
            self.mark_dirty();
        }
        advanced
    }

    /// Gives myself a fresh config epoch without agreement from peers.
    ///
    /// Bumps only when my config epoch is 0 or not already the highest
    /// in the cluster. Returns whether a bump happened.
    pub fn bump_epoch_without_consensus(&mut self) -> bool {
        let max = self.max_config_epoch();
        let mine = self.myself().config_epoch;
        if mine != 0 && mine == max {
            return false;
        }
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.nodes.myself_mut().config_epoch = epoch;
        self.mark_dirty();
        warn!(epoch, "new config epoch set without consensus");
        true
    }

    /// Sets my config epoch by hand.
    ///
    /// Only allowed while I know no other node and my config epoch is
    /// still 0. Raises the current epoch to match.
    pub fn set_config_epoch(&mut self, requested: i64) -> Result<(), CommandError> {
        let epoch = u64::try_from(requested)
            .map_err(|_| CommandError::InvalidConfigEpoch(requested.to_string()))?;
        if self.nodes.len() > 1 {
            return Err(CommandError::ConfigEpochNotAlone);
        }
        if self.myself().config_epoch != 0 {
            return Err(CommandError::ConfigEpochAlreadySet);
        }
        self.nodes.myself_mut().config_epoch = epoch;
        if self.current_epoch < epoch {
            self.current_epoch = epoch;
        }
        self.mark_dirty();
        warn!(epoch, "config epoch set by administrator");
        Ok(())
    }

    /// Resolves an equal config epoch between myself and a master sender.
    ///
    /// The node with the greater id loses and takes `current_epoch + 1`.
    /// Returns true if I bumped.
    pub fn handle_config_epoch_collision(&mut self, sender: &NodeId) -> bool {
        let Some(other) = self.nodes.lookup(sender) else {
            return false;
        };
        let myself = self.myself();
        if other.config_epoch != myself.config_epoch
            || !other.is_master()
            || !myself.is_master()
            || myself.id <= other.id
        {
            return false;
        }
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.nodes.myself_mut().config_epoch = epoch;
        self.mark_dirty();
        info!(
            sender = %sender,
            epoch,
            "config epoch collision with sender, moved to new epoch"
        );
        true
    }
}
