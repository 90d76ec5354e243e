//! The single writer over cluster state.
//!
//! Cron ticks, inbound bus messages and admin commands all arrive as
//! [`Request`]s on one queue and are applied in order by one task, so
//! no two mutations ever interleave and the state needs no locks. After
//! each request the coordinator flushes outbound messages to the
//! [`Transport`], re-derives cluster health and, if anything persistent
//! changed, hands a snapshot to the [`NodeTableStore`].

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::command::{self, CommandContext, Reply, ShutdownMode};
use crate::error::CommandError;
use crate::gossip::{GossipEngine, Outbound};
use crate::message::BusMessage;
use crate::node::ClusterNode;
use crate::state::ClusterState;
use crate::table::{NodeTable, NodeTableStore};
use crate::time::now_ms;

/// Requests waiting for the coordinator. Producers wait when it is full.
const REQUEST_QUEUE: usize = 1024;

/// Sends bus messages to peers.
pub trait Transport: Send + 'static {
    /// Hands `message` off for delivery to `addr`. Must not block;
    /// delivery is best effort.
    fn send(&mut self, addr: SocketAddr, message: BusMessage);

    /// Closes whatever is held open for addresses outside `live`. Runs
    /// after every cron tick with the bus address of every known peer.
    fn retain(&mut self, _live: &HashSet<SocketAddr>) {}
}

/// One unit of work for the coordinator.
#[derive(Debug)]
pub enum Request {
    /// A cron period elapsed.
    Tick,
    /// A decoded message from the bus.
    Inbound {
        peer: SocketAddr,
        message: BusMessage,
    },
    /// An admin command line, split into words.
    Command {
        words: Vec<String>,
        reply: oneshot::Sender<Result<Reply, CommandError>>,
    },
    /// A read-only copy of the node table.
    Snapshot { reply: oneshot::Sender<NodeTable> },
}

/// What the run loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(ShutdownMode),
}

/// Creates the request queue: a cloneable handle and the receiving end
/// for [`Coordinator::run`].
pub fn channel() -> (ClusterHandle, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    (ClusterHandle { requests: tx }, rx)
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    requests: mpsc::Sender<Request>,
}

impl ClusterHandle {
    /// Runs an admin command and waits for its result.
    pub async fn command(&self, words: Vec<String>) -> Result<Reply, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Command { words, reply })
            .await
            .map_err(|_| CommandError::ShuttingDown)?;
        rx.await.map_err(|_| CommandError::ShuttingDown)?
    }

    /// Like [`command`](Self::command), splitting `line` on whitespace.
    pub async fn execute(&self, line: &str) -> Result<Reply, CommandError> {
        self.command(line.split_whitespace().map(str::to_owned).collect())
            .await
    }

    /// Queues an inbound bus message. Returns false once the coordinator
    /// has stopped.
    pub async fn deliver(&self, peer: SocketAddr, message: BusMessage) -> bool {
        self.requests
            .send(Request::Inbound { peer, message })
            .await
            .is_ok()
    }

    /// Queues a cron tick. Returns false once the coordinator has stopped.
    pub async fn tick(&self) -> bool {
        self.requests.send(Request::Tick).await.is_ok()
    }

    /// A copy of the node table, taken between two dispatches.
    pub async fn snapshot(&self) -> Option<NodeTable> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }

    /// True once the coordinator has stopped taking requests.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Resolves once the coordinator has stopped taking requests.
    pub async fn closed(&self) {
        self.requests.closed().await
    }
}

/// Owns the cluster state and applies every mutation to it.
pub struct Coordinator<T, S> {
    state: ClusterState,
    gossip: GossipEngine,
    transport: T,
    store: S,
}

impl<T: Transport, S: NodeTableStore> Coordinator<T, S> {
    pub fn new(state: ClusterState, transport: T, store: S) -> Self {
        let gossip = GossipEngine::new(state.config().clone());
        Self {
            state,
            gossip,
            transport,
            store,
        }
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn into_state(self) -> ClusterState {
        self.state
    }

    /// Applies one request at time `now`.
    pub fn dispatch(&mut self, request: Request, now: u64) -> Flow {
        let mut flow = Flow::Continue;
        match request {
            Request::Tick => {
                let out = self.gossip.tick(&mut self.state, now);
                self.flush(out);
                let live: HashSet<SocketAddr> = self
                    .state
                    .nodes
                    .peers()
                    .filter_map(ClusterNode::bus_addr)
                    .collect();
                self.transport.retain(&live);
            }
            Request::Inbound { peer, message } => {
                let out = self
                    .gossip
                    .handle_message(&mut self.state, peer, message, now);
                self.flush(out);
            }
            Request::Command { words, reply } => {
                let mut ctx =
                    CommandContext::new(&mut self.state, &self.gossip, &mut self.store, now);
                let result = command::dispatch(&mut ctx, &words);
                let out = std::mem::take(&mut ctx.outbound);
                if let Some(mode) = ctx.shutdown {
                    flow = Flow::Stop(mode);
                }
                if let Err(e) = &result {
                    debug!(command = ?words.first(), error = %e, "command failed");
                }
                self.flush(out);
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
                return flow;
            }
        }
        self.state.update_state();
        self.persist();
        flow
    }

    fn flush(&mut self, out: Vec<Outbound>) {
        for Outbound { addr, message } in out {
            self.state.stats.record_sent(message.kind());
            self.transport.send(addr, message);
        }
    }

    /// Saves a snapshot if persistent state changed since the last save.
    fn persist(&mut self) {
        if !self.state.take_dirty() {
            return;
        }
        if let Err(e) = self.store.save(&self.state.snapshot()) {
            error!("failed to save node table: {e}");
        }
    }

    /// Final save on the way out.
    fn finish(&mut self, mode: ShutdownMode) {
        if mode == ShutdownMode::Save {
            match self.store.save(&self.state.snapshot()) {
                Ok(()) => info!("node table saved"),
                Err(e) => error!("failed to save node table on shutdown: {e}"),
            }
        }
    }

    /// Serves requests until SHUTDOWN, the `shutdown` signal, or every
    /// handle is dropped. Requests already queued when the signal arrives
    /// are still applied, except cron ticks.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ClusterState {
        let mode = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break ShutdownMode::Save;
                    }
                }

                request = requests.recv() => {
                    let Some(request) = request else {
                        break ShutdownMode::Save;
                    };
                    if let Flow::Stop(mode) = self.dispatch(request, now_ms()) {
                        break mode;
                    }
                }
            }
        };

        requests.close();
        while let Ok(request) = requests.try_recv() {
            if !matches!(request, Request::Tick) {
                self.dispatch(request, now_ms());
            }
        }
        self.finish(mode);
        info!("coordinator stopped");
        self.state
    }
}
