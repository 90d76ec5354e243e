//! Wiring for a running cluster node.
//!
//! [`Cluster::start`] binds the bus listener and spawns three tasks
//! around one cluster state: the coordinator (the only writer), a cron
//! task that queues a tick every `cron-interval`, and the bus listener.
//! Shutdown stops cron and the listener, lets the coordinator apply what
//! is already queued and save, then gives bus connections
//! `shutdown-grace` to finish before aborting them.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::auth::BusSecret;
use crate::bus::{self, ConnectionSet, TcpTransport};
use crate::coordinator::{self, ClusterHandle, Coordinator};
use crate::state::ClusterState;
use crate::table::NodeTableStore;

/// A running node.
pub struct Cluster {
    handle: ClusterHandle,
    bus_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    coordinator: JoinHandle<ClusterState>,
    cron: JoinHandle<()>,
    listener: JoinHandle<()>,
    connections: ConnectionSet,
    grace: Duration,
}

impl Cluster {
    /// Binds the bus port on `bind` and starts the node.
    pub async fn start<S: NodeTableStore>(
        bind: IpAddr,
        state: ClusterState,
        store: S,
        secret: Option<BusSecret>,
    ) -> io::Result<Self> {
        let port = state
            .config()
            .bus_port()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
        Self::start_with_listener(listener, state, store, secret)
    }

    /// Starts the node on an already bound bus listener.
    pub fn start_with_listener<S: NodeTableStore>(
        listener: TcpListener,
        state: ClusterState,
        store: S,
        secret: Option<BusSecret>,
    ) -> io::Result<Self> {
        let bus_addr = listener.local_addr()?;
        let config = state.config().clone();
        let secret = secret.map(Arc::new);
        let (handle, requests) = coordinator::channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = ConnectionSet::default();

        let transport = TcpTransport::new(config.connect_timeout(), secret.clone(), connections.clone());
        info!(
            id = %state.myself_id(),
            %bus_addr,
            epoch = state.current_epoch,
            "starting cluster node"
        );
        let coordinator = tokio::spawn(
            Coordinator::new(state, transport, store).run(requests, shutdown_rx.clone()),
        );
        let cron = tokio::spawn(run_cron(
            handle.clone(),
            config.cron_interval(),
            shutdown_rx.clone(),
        ));
        let listener = tokio::spawn(bus::serve(
            listener,
            handle.clone(),
            secret,
            connections.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            handle,
            bus_addr,
            shutdown,
            coordinator,
            cron,
            listener,
            connections,
            grace: config.shutdown_grace(),
        })
    }

    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    pub fn bus_addr(&self) -> SocketAddr {
        self.bus_addr
    }

    /// Resolves when the coordinator stops on its own, e.g. after a
    /// SHUTDOWN command.
    pub async fn stopped(&self) {
        self.handle.closed().await
    }

    /// Stops the node and returns its final state.
    pub async fn shutdown(self) -> Option<ClusterState> {
        let _ = self.shutdown.send(true);
        let _ = self.cron.await;
        let _ = self.listener.await;
        let state = match self.coordinator.await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("coordinator task failed: {e}");
                None
            }
        };
        self.connections.drain(self.grace).await;
        info!("cluster node stopped");
        state
    }
}

/// Queues a tick every `every` until shutdown or the coordinator stops.
async fn run_cron(handle: ClusterHandle, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if !handle.tick().await {
                    break;
                }
            }
        }
    }
}
