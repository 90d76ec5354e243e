//! Server configuration file.
//!
//! Resolution order is defaults → TOML file → env vars → CLI flags. The
//! file mirrors [`ServerConfig`]: top-level server keys, plus a
//! `[cluster]` table holding the bus and failure-detector settings.

use std::net::IpAddr;
use std::path::Path;

use cinder_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};

/// Everything the binary needs to start a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address the admin and bus listeners bind to.
    pub bind: String,
    /// Shared secret for bus frame authentication. Empty disables it.
    pub auth_pass: String,
    /// Maximum concurrent admin connections.
    pub max_admin_connections: usize,
    /// Log at debug level unless `RUST_LOG` says otherwise.
    pub verbose: bool,
    pub cluster: ClusterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            auth_pass: String::new(),
            max_admin_connections: 128,
            verbose: false,
            cluster: ClusterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads and parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::from_toml(&text)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// The config as TOML, used by `--config-template`.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn bind_ip(&self) -> Result<IpAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {e}", self.bind))
    }

    /// The log filter used when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "cinder=debug"
        } else {
            "cinder=info"
        }
    }

    /// Checks server-level settings, then the cluster section.
    pub fn validate(&self) -> Result<(), String> {
        self.bind_ip()?;
        if self.max_admin_connections == 0 {
            return Err("max-admin-connections must be at least 1".into());
        }
        self.cluster.validate().map_err(|e| e.to_string())
    }
}
