//! Cluster configuration.
//!
//! A `ClusterConfig` is built once at startup, validated, wrapped in an
//! `Arc`, and handed to every component constructor. Nothing mutates it
//! afterwards.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Offset between the client port and the cluster bus port.
pub const BUS_PORT_OFFSET: u16 = 10000;

/// Settings for the cluster bus and failure detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// IP announced to peers. When unset, peers use the address they
    /// observe on the connection.
    pub announce_ip: Option<IpAddr>,
    /// Client port announced to peers.
    pub announce_port: u16,
    /// Bus port announced to peers. Defaults to port + 10000.
    pub announce_bus_port: Option<u16>,
    /// Milliseconds without a pong before a node is suspected (PFAIL).
    pub node_timeout: u64,
    /// Minimum replicas a master keeps before one may migrate away.
    pub migration_barrier: i64,
    /// Whether every slot must be served for the cluster to be OK.
    pub require_full_coverage: bool,
    /// Milliseconds between cron ticks.
    pub cron_interval: u64,
    /// Seconds a forgotten node stays blacklisted.
    pub blacklist_ttl: u64,
    /// Random candidates examined when picking the periodic ping target.
    pub ping_sample_size: usize,
    /// Milliseconds allowed for an outbound bus connection to establish.
    pub connect_timeout: u64,
    /// Milliseconds to wait for connection tasks during shutdown.
    pub shutdown_grace: u64,
    /// Node table file. Defaults to `nodes-<port>.conf`.
    pub config_file: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            announce_ip: None,
            announce_port: 6379,
            announce_bus_port: None,
            node_timeout: 15_000,
            migration_barrier: 1,
            require_full_coverage: true,
            cron_interval: 100,
            blacklist_ttl: 60,
            ping_sample_size: 5,
            connect_timeout: 1_000,
            shutdown_grace: 10_000,
            config_file: None,
        }
    }
}

impl ClusterConfig {
    /// Checks every field. Called once before the config is shared.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_port == 0 {
            return Err(ConfigError::Port(0));
        }
        let bus_port = self.bus_port()?;
        if bus_port == 0 {
            return Err(ConfigError::BusPort(0));
        }
        if self.node_timeout == 0 {
            return Err(ConfigError::NodeTimeout(self.node_timeout));
        }
        if self.migration_barrier < 1 {
            return Err(ConfigError::MigrationBarrier(self.migration_barrier));
        }
        let limit = self.node_timeout / 10;
        if self.cron_interval == 0 || self.cron_interval > limit {
            return Err(ConfigError::CronInterval {
                interval: self.cron_interval,
                limit,
            });
        }
        if self.ping_sample_size == 0 {
            return Err(ConfigError::PingSampleSize);
        }
        Ok(())
    }

    /// The announced bus port, derived from the client port when unset.
    pub fn bus_port(&self) -> Result<u16, ConfigError> {
        match self.announce_bus_port {
            Some(port) => Ok(port),
            None => self
                .announce_port
                .checked_add(BUS_PORT_OFFSET)
                .ok_or(ConfigError::BusPort(
                    self.announce_port as u32 + BUS_PORT_OFFSET as u32,
                )),
        }
    }

    /// Node table path, `nodes-<port>.conf` unless configured.
    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("nodes-{}.conf", self.announce_port)))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout)
    }

    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace)
    }

    /// Blacklist TTL in milliseconds.
    pub fn blacklist_ttl_ms(&self) -> u64 {
        self.blacklist_ttl.saturating_mul(1000)
    }

    /// A handshake that has not completed after this many ms is dropped.
    pub fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout.max(1000)
    }

    /// Failure reports older than this many ms no longer count.
    pub fn fail_report_validity_ms(&self) -> u64 {
        self.node_timeout.saturating_mul(2)
    }
}
