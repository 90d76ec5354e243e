//! Error types for cluster operations.
//!
//! Three families, matching where a failure can originate:
//!
//! - [`ConfigError`]: rejected at startup, never produced afterwards.
//! - [`ProtocolError`]: a malformed bus frame. The message is dropped and
//!   the connection it arrived on may be closed; no other peer is affected.
//! - [`CommandError`]: an administrative request that was invalid or
//!   violated a constraint. No state is mutated when one is returned.

/// A node id that is not 40 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id")]
pub struct InvalidNodeId;

/// Returned when adding a node whose id is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("node {0} is already known")]
pub struct DuplicateNode(pub crate::NodeId);

/// Startup configuration errors. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("illegal port {0}")]
    Port(u32),

    #[error("illegal bus port {0}")]
    BusPort(u32),

    #[error("illegal node timeout {0}ms")]
    NodeTimeout(u64),

    #[error("illegal migration barrier {0}")]
    MigrationBarrier(i64),

    #[error("cron interval {interval}ms must be non-zero and at most node-timeout/10 ({limit}ms)")]
    CronInterval { interval: u64, limit: u64 },

    #[error("ping sample size must be at least 1")]
    PingSampleSize,

    #[error("corrupt node table at line {line}: {reason}")]
    NodeTable { line: usize, reason: String },
}

/// Errors produced while decoding or authenticating a bus frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated message: {0}")]
    Truncated(&'static str),

    #[error("unknown message type: {0}")]
    UnknownType(u16),

    #[error("invalid field: {0}")]
    Invalid(String),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("frame authentication failed")]
    BadSignature,
}

impl From<InvalidNodeId> for ProtocolError {
    fn from(_: InvalidNodeId) -> Self {
        ProtocolError::Invalid("node id".into())
    }
}

/// Administrative command failures.
///
/// `Display` renders the text a command layer sends back to its client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("ERR Wrong CLUSTER subcommand or number of arguments")]
    WrongSubcommand,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR Invalid node address specified: {0}")]
    InvalidAddress(String),

    #[error("ERR Invalid or out of range slot {0}")]
    InvalidSlot(String),

    #[error("ERR Slot {0} specified multiple times")]
    SlotRepeated(u16),

    #[error("ERR Slot {0} is already busy")]
    SlotBusy(u16),

    #[error("ERR Slot {0} is not owned by this node")]
    SlotNotOwned(u16),

    #[error("ERR Unknown node {0}")]
    UnknownNode(String),

    #[error("ERR I tried hard but I can't forget myself...")]
    CantForgetMyself,

    #[error("ERR Can't forget my master!")]
    CantForgetMyMaster,

    #[error("ERR Can't replicate myself")]
    CantReplicateMyself,

    #[error("ERR I can only replicate a master, not a slave.")]
    CantReplicateSlave,

    #[error("ERR To set a master the node must be empty and without assigned slots.")]
    NotEmptyMaster,

    #[error("ERR The specified node is not a master")]
    NotAMaster,

    #[error("ERR Invalid config epoch specified: {0}")]
    InvalidConfigEpoch(String),

    #[error("ERR The user can assign a config epoch only when the node does not know any other node.")]
    ConfigEpochNotAlone,

    #[error("ERR Node config epoch is already non-zero")]
    ConfigEpochAlreadySet,

    #[error("ERR Error saving the cluster node config: {0}")]
    SaveFailed(String),

    #[error("ERR cluster is shutting down")]
    ShuttingDown,
}

impl CommandError {
    /// Returns true if the error came from argument parsing rather than
    /// a cluster constraint.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            CommandError::WrongSubcommand
                | CommandError::WrongArity(_)
                | CommandError::UnknownCommand(_)
        )
    }
}
