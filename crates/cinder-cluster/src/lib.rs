//! cinder-cluster: gossip membership and failure detection for a
//! 16384-slot keyspace.
//!
//! Every node keeps its own view of the cluster: which nodes exist, who
//! owns which hash slot, who is a replica of whom, and which nodes are
//! suspected or confirmed down. Views converge by exchanging heartbeats
//! over a dedicated TCP bus.
//!
//! # Architecture
//!
//! - **Slots**: CRC16 key hashing and the slot-to-owner table
//! - **Registry**: known nodes, blacklist of forgotten ids
//! - **Gossip**: handshakes, heartbeats, gossip sections
//! - **Failure detection**: PFAIL timeouts, report quorum, FAIL broadcast
//! - **Epochs**: config epoch collisions and slot ownership by epoch
//! - **Coordinator**: the single task that mutates cluster state
//! - **Bus**: framed TCP links with optional HMAC authentication
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cinder_cluster::{Cluster, ClusterConfig, ClusterState, NoopStore, now_ms};
//!
//! let config = Arc::new(ClusterConfig::default());
//! let state = ClusterState::new(config, now_ms())?;
//! let bind = "0.0.0.0".parse()?;
//! let cluster = Cluster::start(bind, state, NoopStore, None).await?;
//! let reply = cluster.handle().execute("CLUSTER MEET 10.0.0.2 6379").await?;
//! ```

mod auth;
mod bus;
mod command;
mod config;
mod coordinator;
mod epoch;
mod error;
mod failure;
mod gossip;
mod message;
mod node;
mod registry;
mod runtime;
mod slots;
mod state;
mod table;
mod time;

pub use auth::BusSecret;
pub use bus::{read_frame, write_frame, ConnectionSet, TcpTransport, MAX_FRAME_SIZE};
pub use command::{command_names, Reply, ShutdownMode};
pub use config::{ClusterConfig, BUS_PORT_OFFSET};
pub use coordinator::{channel, ClusterHandle, Coordinator, Flow, Request, Transport};
pub use error::{CommandError, ConfigError, DuplicateNode, InvalidNodeId, ProtocolError};
pub use gossip::{GossipEngine, Outbound};
pub use message::{BusMessage, GossipSection, MessageBody, MessageType, SenderHeader};
pub use node::{ClusterNode, NodeFlags, NodeId, NodeRole};
pub use runtime::Cluster;
pub use slots::{key_hash_slot, SlotRange, SLOT_COUNT};
pub use state::{ClusterHealth, ClusterState, MessageStats};
pub use table::{NodeRecord, NodeTable, NodeTableStore, NoopStore};
pub use time::now_ms;
