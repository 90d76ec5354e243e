mod admin;
mod config;
mod nodes_file;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cinder_cluster::{now_ms, BusSecret, Cluster, ClusterState};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;
use crate::nodes_file::FileStore;

#[derive(Parser)]
#[command(name = "cinder-server", about = "cinder cluster bus node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address the admin and bus listeners bind to
    #[arg(long, env = "CINDER_BIND")]
    bind: Option<String>,

    /// client port announced to peers; the admin listener uses it too
    #[arg(short, long, env = "CINDER_PORT")]
    port: Option<u16>,

    /// cluster bus port. defaults to port + 10000
    #[arg(long, env = "CINDER_BUS_PORT")]
    bus_port: Option<u16>,

    /// IP announced to peers. when unset, peers use the address they see
    #[arg(long, env = "CINDER_ANNOUNCE_IP")]
    announce_ip: Option<std::net::IpAddr>,

    /// milliseconds without a pong before a node is suspected
    #[arg(long, env = "CINDER_NODE_TIMEOUT")]
    node_timeout: Option<u64>,

    /// milliseconds between cron ticks
    #[arg(long, env = "CINDER_CRON_INTERVAL")]
    cron_interval: Option<u64>,

    /// node table file. defaults to nodes-<port>.conf
    #[arg(long, env = "CINDER_NODES_FILE")]
    nodes_file: Option<PathBuf>,

    /// stay OK while some slots are unserved
    #[arg(long, env = "CINDER_PARTIAL_COVERAGE")]
    partial_coverage: bool,

    /// shared secret for authenticating bus frames.
    /// when set, unauthenticated frames are dropped.
    #[arg(long, env = "CINDER_AUTH_PASS")]
    auth_pass: Option<String>,

    /// log at debug level when RUST_LOG is unset
    #[arg(short, long, env = "CINDER_VERBOSE")]
    verbose: bool,

    /// path to a file containing the bus secret (alternative to
    /// --auth-pass). the file contents are trimmed of trailing whitespace.
    #[arg(long, env = "CINDER_AUTH_PASS_FILE")]
    auth_pass_file: Option<PathBuf>,
}

/// Applies CLI overrides to a `ServerConfig`. Only `Some` values from the
/// CLI args take effect, preserving the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.cluster.announce_port = port;
    }
    if let Some(port) = args.bus_port {
        cfg.cluster.announce_bus_port = Some(port);
    }
    if let Some(ip) = args.announce_ip {
        cfg.cluster.announce_ip = Some(ip);
    }
    if let Some(v) = args.node_timeout {
        cfg.cluster.node_timeout = v;
    }
    if let Some(v) = args.cron_interval {
        cfg.cluster.cron_interval = v;
    }
    if let Some(ref path) = args.nodes_file {
        cfg.cluster.config_file = Some(path.clone());
    }
    if args.partial_coverage {
        cfg.cluster.require_full_coverage = false;
    }
    if args.verbose {
        cfg.verbose = true;
    }
    if let Some(ref pass) = args.auth_pass {
        cfg.auth_pass = pass.clone();
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Resolves the bus secret from config + optional file flag.
/// The config value and --auth-pass-file are mutually exclusive.
fn resolve_bus_secret(cfg: &ServerConfig, args: &Args) -> Option<BusSecret> {
    if !cfg.auth_pass.is_empty() && args.auth_pass_file.is_some() {
        exit_err("error: --auth-pass and --auth-pass-file are mutually exclusive");
    }
    if !cfg.auth_pass.is_empty() {
        return Some(BusSecret::new(cfg.auth_pass.as_bytes()));
    }
    let path = args.auth_pass_file.as_ref()?;
    let contents = std::fs::read_to_string(path).unwrap_or_else(|e| {
        exit_err(format!(
            "error: failed to read --auth-pass-file '{}': {e}",
            path.display()
        ))
    });
    // trailing newline from `echo secret > file`
    let pass = contents.trim_end();
    if pass.is_empty() {
        exit_err(format!("error: --auth-pass-file '{}' is empty", path.display()));
    }
    Some(BusSecret::new(pass.as_bytes()))
}

/// Restores the node from its table file, or creates a fresh node when
/// there is none.
fn load_state(config: Arc<cinder_cluster::ClusterConfig>) -> ClusterState {
    let path = config.config_file();
    let now = now_ms();
    match nodes_file::load(&path) {
        Ok(Some(table)) => {
            let state = ClusterState::restore(config, &table, now)
                .unwrap_or_else(|e| exit_err(format!("failed to restore '{}': {e}", path.display())));
            info!(
                path = %path.display(),
                nodes = state.nodes.len(),
                epoch = state.current_epoch,
                "restored node table"
            );
            state
        }
        Ok(None) => {
            let state = ClusterState::new(config, now).unwrap_or_else(|e| exit_err(e));
            info!(path = %path.display(), "no node table found, starting as a new node");
            state
        }
        Err(e) => exit_err(format!("failed to load '{}': {e}", path.display())),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.default_log_filter().into()),
        )
        .init();

    if let Err(e) = cfg.validate() {
        exit_err(format!("invalid configuration: {e}"));
    }

    let secret = resolve_bus_secret(&cfg, &args);
    if secret.is_some() {
        info!("cluster bus authentication enabled");
    }

    let bind = cfg.bind_ip().unwrap_or_else(|e| exit_err(e));
    let config = Arc::new(cfg.cluster.clone());
    let state = load_state(config.clone());

    let admin_addr = SocketAddr::new(bind, config.announce_port);
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind admin port {admin_addr}: {e}")));

    let store = FileStore::new(config.config_file());
    let cluster = Cluster::start(bind, state, store, secret)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to start cluster bus: {e}")));

    let (admin_stop, admin_stop_rx) = watch::channel(false);
    let admin = tokio::spawn(admin::serve(
        admin_listener,
        cluster.handle(),
        cfg.max_admin_connections,
        admin_stop_rx,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = cluster.stopped() => info!("shutdown requested"),
    }

    let _ = admin_stop.send(true);
    let _ = admin.await;
    if cluster.shutdown().await.is_none() {
        exit_err("cluster did not shut down cleanly");
    }
}
