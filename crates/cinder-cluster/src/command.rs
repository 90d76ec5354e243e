//! Administrative commands.
//!
//! Each command is a row in a static table: a name, an arity and a plain
//! handler function. Dispatch looks the name up, checks the argument
//! count and calls the handler against the cluster state. Handlers run
//! inside the coordinator, so they see and mutate the state directly.
//!
//! Errors carry their wire text (see [`CommandError`]); rendering
//! replies for a client is up to the caller.

use std::fmt;
use std::net::IpAddr;

use tracing::info;

use crate::config::BUS_PORT_OFFSET;
use crate::error::CommandError;
use crate::gossip::{GossipEngine, Outbound};
use crate::slots::{key_hash_slot, SlotBitmap, SLOT_COUNT};
use crate::state::ClusterState;
use crate::table::NodeTableStore;
use crate::NodeId;

/// A successful command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// A one-line status, e.g. `BUMPED 5`.
    Status(String),
    /// Free text, possibly multi-line.
    Bulk(String),
    Integer(i64),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::Status(s) | Reply::Bulk(s) => f.write_str(s),
            Reply::Integer(n) => write!(f, "{n}"),
        }
    }
}

/// What SHUTDOWN asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Save the node table before stopping.
    Save,
    NoSave,
}

/// Everything a handler may touch.
///
/// Handlers leave side effects that outlive the call in `outbound` and
/// `shutdown`; the coordinator acts on them afterwards.
pub struct CommandContext<'a> {
    pub state: &'a mut ClusterState,
    pub gossip: &'a GossipEngine,
    pub store: &'a mut dyn NodeTableStore,
    pub now: u64,
    pub outbound: Vec<Outbound>,
    pub shutdown: Option<ShutdownMode>,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        state: &'a mut ClusterState,
        gossip: &'a GossipEngine,
        store: &'a mut dyn NodeTableStore,
        now: u64,
    ) -> Self {
        Self {
            state,
            gossip,
            store,
            now,
            outbound: Vec::new(),
            shutdown: None,
        }
    }

    /// Announces a config change to every peer right away.
    fn announce(&mut self) {
        let pongs = self.gossip.broadcast_pong(self.state);
        self.outbound.extend(pongs);
    }
}

type Handler = fn(&mut CommandContext<'_>, &[&str]) -> Result<Reply, CommandError>;

/// Accepted argument counts, not counting the command name.
#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
            Arity::Between(min, max) => (min..=max).contains(&n),
        }
    }
}

struct CommandSpec {
    name: &'static str,
    arity: Arity,
    handler: Handler,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "MEET", arity: Arity::Between(2, 3), handler: meet },
    CommandSpec { name: "NODES", arity: Arity::Exact(0), handler: nodes },
    CommandSpec { name: "MYID", arity: Arity::Exact(0), handler: myid },
    CommandSpec { name: "INFO", arity: Arity::Exact(0), handler: info },
    CommandSpec { name: "BUMPEPOCH", arity: Arity::Exact(0), handler: bumpepoch },
    CommandSpec { name: "SAVECONFIG", arity: Arity::Exact(0), handler: saveconfig },
    CommandSpec { name: "KEYSLOT", arity: Arity::Exact(1), handler: keyslot },
    CommandSpec { name: "FORGET", arity: Arity::Exact(1), handler: forget },
    CommandSpec { name: "REPLICATE", arity: Arity::Exact(1), handler: replicate },
    CommandSpec { name: "SLAVES", arity: Arity::Exact(1), handler: slaves },
    CommandSpec { name: "COUNT-FAILURE-REPORTS", arity: Arity::Exact(1), handler: count_failure_reports },
    CommandSpec { name: "SET-CONFIG-EPOCH", arity: Arity::Exact(1), handler: set_config_epoch },
    CommandSpec { name: "ADDSLOTS", arity: Arity::AtLeast(1), handler: addslots },
    CommandSpec { name: "DELSLOTS", arity: Arity::AtLeast(1), handler: delslots },
    CommandSpec { name: "SHUTDOWN", arity: Arity::Between(0, 1), handler: shutdown },
];

/// Names of every supported command.
pub fn command_names() -> impl Iterator<Item = &'static str> {
    COMMANDS.iter().map(|c| c.name)
}

/// Runs one command line, already split into words. A leading `CLUSTER`
/// is accepted and skipped; names are case-insensitive.
pub fn dispatch(ctx: &mut CommandContext<'_>, words: &[String]) -> Result<Reply, CommandError> {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    let words = match words.split_first() {
        Some((first, rest)) if first.eq_ignore_ascii_case("CLUSTER") => rest,
        _ => &words[..],
    };
    let Some((name, args)) = words.split_first() else {
        return Err(CommandError::WrongSubcommand);
    };
    let spec = COMMANDS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| CommandError::UnknownCommand((*name).to_owned()))?;
    if !spec.arity.accepts(args.len()) {
        return Err(CommandError::WrongArity(spec.name.to_ascii_lowercase()));
    }
    (spec.handler)(ctx, args)
}

/// Resolves an id argument to a known node.
fn known_node(state: &ClusterState, arg: &str) -> Result<NodeId, CommandError> {
    NodeId::parse(arg)
        .ok()
        .filter(|id| state.nodes.contains(id))
        .ok_or_else(|| CommandError::UnknownNode(arg.to_owned()))
}

fn parse_slot(arg: &str) -> Result<u16, CommandError> {
    arg.parse::<u16>()
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| CommandError::InvalidSlot(arg.to_owned()))
}

/// Parses a slot list, refusing any slot named twice.
fn parse_slots(args: &[&str]) -> Result<SlotBitmap, CommandError> {
    let mut slots = SlotBitmap::new();
    for arg in args {
        let slot = parse_slot(arg)?;
        if !slots.insert(slot) {
            return Err(CommandError::SlotRepeated(slot));
        }
    }
    Ok(slots)
}

fn meet(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let invalid = || CommandError::InvalidAddress(format!("{}:{}", args[0], args[1]));
    let ip: IpAddr = args[0].parse().map_err(|_| invalid())?;
    let port: u16 = args[1].parse().map_err(|_| invalid())?;
    let bus_port = match args.get(2) {
        Some(bus) => bus.parse().map_err(|_| invalid())?,
        None => port.checked_add(BUS_PORT_OFFSET).ok_or_else(invalid)?,
    };
    ctx.gossip
        .start_handshake(ctx.state, ip, port, bus_port, ctx.now)?;
    Ok(Reply::Ok)
}

fn nodes(ctx: &mut CommandContext<'_>, _args: &[&str]) -> Result<Reply, CommandError> {
    Ok(Reply::Bulk(ctx.state.nodes_description()))
}

fn myid(ctx: &mut CommandContext<'_>, _args: &[&str]) -> Result<Reply, CommandError> {
    Ok(Reply::Bulk(ctx.state.myself_id().as_str().to_owned()))
}

fn info(ctx: &mut CommandContext<'_>, _args: &[&str]) -> Result<Reply, CommandError> {
    Ok(Reply::Bulk(ctx.state.info()))
}

fn bumpepoch(ctx: &mut CommandContext<'_>, _args: &[&str]) -> Result<Reply, CommandError> {
    let bumped = ctx.state.bump_epoch_without_consensus();
    let epoch = ctx.state.myself().config_epoch;
    if bumped {
        ctx.announce();
        Ok(Reply::Status(format!("BUMPED {epoch}")))
    } else {
        Ok(Reply::Status(format!("STILL {epoch}")))
    }
}

fn saveconfig(ctx: &mut CommandContext<'_>, _args: &[&str]) -> Result<Reply, CommandError> {
    ctx.store
        .save(&ctx.state.snapshot())
        .map_err(|e| CommandError::SaveFailed(e.to_string()))?;
    ctx.state.take_dirty();
    Ok(Reply::Ok)
}

fn keyslot(_ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    Ok(Reply::Integer(i64::from(key_hash_slot(args[0].as_bytes()))))
}

fn forget(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let id = known_node(ctx.state, args[0])?;
    if ctx.state.nodes.is_myself(&id) {
        return Err(CommandError::CantForgetMyself);
    }
    let myself = ctx.state.myself();
    if myself.is_slave() && myself.slaveof == Some(id) {
        return Err(CommandError::CantForgetMyMaster);
    }
    let ttl = ctx.state.config().blacklist_ttl_ms();
    ctx.state.blacklist.add(id, ttl, ctx.now);
    ctx.state.del_node(&id);
    info!(node = %id, ttl_ms = ttl, "node forgotten and blacklisted");
    Ok(Reply::Ok)
}

fn replicate(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let id = known_node(ctx.state, args[0])?;
    ctx.state.nodes.set_my_master_to(&id)?;
    ctx.state.mark_dirty();
    ctx.announce();
    Ok(Reply::Ok)
}

fn slaves(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let id = known_node(ctx.state, args[0])?;
    let state = &*ctx.state;
    let Some(master) = state.nodes.lookup(&id).filter(|n| n.is_master()) else {
        return Err(CommandError::NotAMaster);
    };
    let text = master
        .slaves
        .iter()
        .filter_map(|s| state.nodes.lookup(s))
        .map(|s| state.node_description(s))
        .collect();
    Ok(Reply::Bulk(text))
}

fn count_failure_reports(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let id = known_node(ctx.state, args[0])?;
    let count = ctx.state.failure_report_count(&id, ctx.now);
    Ok(Reply::Integer(count as i64))
}

fn set_config_epoch(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let epoch: i64 = args[0]
        .parse()
        .map_err(|_| CommandError::InvalidConfigEpoch(args[0].to_owned()))?;
    ctx.state.set_config_epoch(epoch)?;
    Ok(Reply::Ok)
}

fn addslots(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let slots = parse_slots(args)?;
    if let Some(busy) = slots.iter().find(|s| ctx.state.slots.owner_of(*s).is_some()) {
        return Err(CommandError::SlotBusy(busy));
    }
    let me = ctx.state.myself_id();
    for slot in slots.iter() {
        ctx.state.add_slot(slot, me);
    }
    info!(count = slots.count(), "slots added to myself");
    Ok(Reply::Ok)
}

fn delslots(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let slots = parse_slots(args)?;
    let me = ctx.state.myself_id();
    if let Some(foreign) = slots.iter().find(|s| ctx.state.slots.owner_of(*s) != Some(me)) {
        return Err(CommandError::SlotNotOwned(foreign));
    }
    for slot in slots.iter() {
        ctx.state.del_slot(slot);
    }
    info!(count = slots.count(), "slots removed from myself");
    Ok(Reply::Ok)
}

fn shutdown(ctx: &mut CommandContext<'_>, args: &[&str]) -> Result<Reply, CommandError> {
    let mode = match args.first() {
        None => ShutdownMode::Save,
        Some(arg) if arg.eq_ignore_ascii_case("SAVE") => ShutdownMode::Save,
        Some(arg) if arg.eq_ignore_ascii_case("NOSAVE") => ShutdownMode::NoSave,
        Some(_) => return Err(CommandError::WrongSubcommand),
    };
    ctx.shutdown = Some(mode);
    Ok(Reply::Ok)
}
