//! TCP transport for the cluster bus.
//!
//! Length-prefixed framing: a 4-byte big-endian u32 length followed by an
//! encoded [`BusMessage`]. When a [`BusSecret`] is configured, an
//! HMAC-SHA256 tag is appended inside the length-delimited frame and the
//! receiver verifies it before decoding.
//!
//! Outbound traffic goes through one link task per peer address, fed by
//! a bounded queue so the coordinator never waits on the network.
//! Inbound connections are read by their own tasks and every decoded
//! message is queued for the coordinator.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::auth::{BusSecret, TAG_LEN};
use crate::coordinator::{ClusterHandle, Transport};
use crate::error::ProtocolError;
use crate::message::BusMessage;

/// Largest accepted frame. A full heartbeat with the maximum number of
/// gossip sections is well under this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frames queued per outbound link before new ones are dropped.
const LINK_QUEUE: usize = 256;

/// Writes one frame, signing it when a secret is given.
pub async fn write_frame<W>(w: &mut W, payload: &[u8], secret: Option<&BusSecret>) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let total = payload.len() + if secret.is_some() { TAG_LEN } else { 0 };
    if total > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            ProtocolError::FrameTooLarge(total),
        ));
    }
    let prefix = (total as u32).to_be_bytes();
    w.write_all(&prefix).await?;
    w.write_all(payload).await?;
    if let Some(secret) = secret {
        w.write_all(&secret.tag(prefix, payload)).await?;
    }
    w.flush().await
}

/// Reads one frame. Oversized frames fail with
/// [`ProtocolError::FrameTooLarge`] and, when a secret is given, frames
/// whose tag does not verify with [`ProtocolError::BadSignature`].
pub async fn read_frame<R>(r: &mut R, secret: Option<&BusSecret>) -> io::Result<Bytes>
where
    R: AsyncReadExt + Unpin,
{
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge(len),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    let Some(secret) = secret else {
        return Ok(Bytes::from(buf));
    };
    let payload_len = secret
        .open(prefix, &buf)
        .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e))?
        .len();
    buf.truncate(payload_len);
    Ok(Bytes::from(buf))
}

/// Tracks connection tasks so shutdown can wait for them, then abort
/// the stragglers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSet {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl ConnectionSet {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // reap finished tasks so the set stays small
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Number of tracked tasks, finished ones included until reaped.
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `grace` for every task, then aborts what is left.
    pub async fn drain(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(
                remaining = tasks.len(),
                "grace period elapsed, aborting bus connections"
            );
            tasks.shutdown().await;
        }
    }
}

/// Sends bus messages over TCP, one link per peer.
pub struct TcpTransport {
    links: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    connect_timeout: Duration,
    secret: Option<Arc<BusSecret>>,
    connections: ConnectionSet,
}

impl TcpTransport {
    pub fn new(
        connect_timeout: Duration,
        secret: Option<Arc<BusSecret>>,
        connections: ConnectionSet,
    ) -> Self {
        Self {
            links: HashMap::new(),
            connect_timeout,
            secret,
            connections,
        }
    }

    fn open_link(&mut self, addr: SocketAddr) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        self.connections.spawn(run_link(
            addr,
            rx,
            self.connect_timeout,
            self.secret.clone(),
        ));
        self.links.insert(addr, tx.clone());
        tx
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, addr: SocketAddr, message: BusMessage) {
        let frame = message.encode();
        let live = self
            .links
            .get(&addr)
            .filter(|link| !link.is_closed())
            .cloned();
        let link = match live {
            Some(link) => link,
            None => self.open_link(addr),
        };
        if let Err(e) = link.try_send(frame) {
            debug!("bus link to {addr} is backed up, dropping message: {e}");
        }
    }

    /// Drops links to addresses no known node uses, and links whose task
    /// has already ended. A dropped link still writes what it had queued,
    /// then closes its connection.
    fn retain(&mut self, live: &HashSet<SocketAddr>) {
        let before = self.links.len();
        self.links
            .retain(|addr, link| live.contains(addr) && !link.is_closed());
        let dropped = before - self.links.len();
        if dropped > 0 {
            debug!(dropped, open = self.links.len(), "closed idle bus links");
        }
    }
}

/// Connects to `addr` and writes queued frames until the queue closes or
/// the connection fails. A failed link is replaced on the next send.
/// Once the transport drops the sending side, the stream is closed.
async fn run_link(
    addr: SocketAddr,
    mut frames: mpsc::Receiver<Bytes>,
    connect_timeout: Duration,
    secret: Option<Arc<BusSecret>>,
) {
    let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("bus connect to {addr} failed: {e}");
            return;
        }
        Err(_) => {
            debug!("bus connect to {addr} timed out");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    trace!("bus link to {addr} established");

    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame, secret.as_deref()).await {
            debug!("bus write to {addr} failed: {e}");
            return;
        }
    }
}

/// Accepts bus connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    handle: ClusterHandle,
    secret: Option<Arc<BusSecret>>,
    connections: ConnectionSet,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("cluster bus listening on {addr}");
    }
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("bus accept error: {e}");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                connections.spawn(read_connection(
                    stream,
                    peer,
                    handle.clone(),
                    secret.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
    debug!("cluster bus listener stopped");
}

/// Reads frames from one peer connection. Any undecodable or
/// unauthenticated frame closes the connection.
async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handle: ClusterHandle,
    secret: Option<Arc<BusSecret>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            frame = read_frame(&mut stream, secret.as_deref()) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!("bus connection from {peer} closed");
                return;
            }
            Err(e) => {
                debug!("bus read error from {peer}: {e}");
                return;
            }
        };
        let message = match BusMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("bus decode error from {peer}: {e}");
                return;
            }
        };
        if !handle.deliver(peer, message).await {
            return;
        }
    }
}
