//! Admin listener on the announce port.
//!
//! Clients send one command per line, words separated by whitespace
//! (`CLUSTER NODES`, `MEET 10.0.0.2 6379`). Replies use RESP2 framing so
//! `redis-cli` and friends can talk to it. Each connection is served by
//! its own task; the number of live connections is capped.

use std::net::SocketAddr;
use std::sync::Arc;

use cinder_cluster::{ClusterHandle, CommandError, Reply};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Longest accepted command line.
const MAX_LINE: usize = 64 * 1024;

/// Accepts admin connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    handle: ClusterHandle,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("admin listening on {addr}");
    }
    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("admin accept error: {e}");
                        continue;
                    }
                };
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("admin connection limit reached, dropping connection from {peer}");
                    continue;
                };
                let handle = handle.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, handle, shutdown).await {
                        debug!("admin connection error from {peer}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }
    debug!("admin listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: ClusterHandle,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE as u64);
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(()),
            read = limited.read_line(&mut line) => read?,
        };
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read == MAX_LINE {
            writer.write_all(b"-ERR line too long\r\n").await?;
            return Ok(());
        }

        let words: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
        if words.is_empty() {
            continue;
        }
        if words[0].eq_ignore_ascii_case("QUIT") {
            writer.write_all(b"+OK\r\n").await?;
            return Ok(());
        }

        let result = handle.command(words).await;
        if let Err(CommandError::ShuttingDown) = result {
            debug!("admin connection from {peer} closed, node shutting down");
        }
        writer.write_all(encode(&result).as_bytes()).await?;
        if handle.is_closed() {
            return Ok(());
        }
    }
}

/// Renders a command result as a RESP2 frame.
pub fn encode(result: &Result<Reply, CommandError>) -> String {
    match result {
        Ok(Reply::Ok) => "+OK\r\n".into(),
        Ok(Reply::Status(s)) => format!("+{s}\r\n"),
        Ok(Reply::Integer(n)) => format!(":{n}\r\n"),
        Ok(Reply::Bulk(text)) => format!("${}\r\n{text}\r\n", text.len()),
        Err(e) => format!("-{e}\r\n"),
    }
}
