//! Test helpers for spawning a cinder-server and sending admin commands.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A cinder-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub port: u16,
    pub bus_port: u16,
    _data_dir: Option<tempfile::TempDir>,
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    pub auth_pass: Option<String>,
    /// Use an existing directory for the node table without taking
    /// ownership. A fresh temp directory is used otherwise.
    pub data_dir_path: Option<PathBuf>,
}

impl TestServer {
    /// Starts a new cinder-server on random ports.
    ///
    /// Blocks until the admin port accepts connections (up to 5 seconds).
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    pub fn start_with(opts: ServerOptions) -> Self {
        let port = find_free_port();
        let bus_port = find_free_port();
        let (mut cmd, data_dir) = command(&opts, port, bus_port);

        let child = cmd.spawn().unwrap_or_else(|e| {
            panic!("failed to spawn cinder-server at {}: {e}", server_binary().display())
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if Instant::now() > deadline {
                panic!("cinder-server failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            port,
            bus_port,
            _data_dir: data_dir,
        }
    }

    /// Runs a server that is expected to refuse to start, returning its
    /// exit status.
    pub fn start_expecting_exit(opts: ServerOptions) -> ExitStatus {
        let (mut cmd, _data_dir) = command(&opts, find_free_port(), find_free_port());
        let mut child = cmd.spawn().unwrap();
        wait_for_exit(&mut child, Duration::from_secs(5))
            .unwrap_or_else(|| panic!("cinder-server kept running"))
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.port).await
    }

    /// Waits for the process to exit on its own.
    pub fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        wait_for_exit(&mut self.child, timeout)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn command(opts: &ServerOptions, port: u16, bus_port: u16) -> (Command, Option<tempfile::TempDir>) {
    let mut cmd = Command::new(server_binary());
    cmd.arg("--bind").arg("127.0.0.1");
    cmd.arg("--announce-ip").arg("127.0.0.1");
    cmd.arg("--port").arg(port.to_string());
    cmd.arg("--bus-port").arg(bus_port.to_string());
    // suppress tracing output in tests
    cmd.env("RUST_LOG", "error");

    if let Some(ref pass) = opts.auth_pass {
        cmd.arg("--auth-pass").arg(pass);
    }

    let (dir, owned) = match opts.data_dir_path {
        Some(ref path) => (path.clone(), None),
        None => {
            let dir = tempfile::tempdir().unwrap();
            (dir.path().to_path_buf(), Some(dir))
        }
    };
    cmd.arg("--nodes-file").arg(dir.join("nodes.conf"));
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    (cmd, owned)
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    None
}

/// One admin reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(String),
}

/// A minimal admin client: inline commands out, RESP2 replies in.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{port}: {e}"));
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Sends a command line and reads one reply.
    pub async fn cmd(&mut self, line: &str) -> Resp {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();

        let mut header = String::new();
        let n = self.reader.read_line(&mut header).await.unwrap();
        if n == 0 {
            panic!("server closed connection while waiting for response");
        }
        let header = header.trim_end_matches(['\r', '\n']);
        let (kind, rest) = header.split_at(1);
        match kind {
            "+" => Resp::Simple(rest.to_owned()),
            "-" => Resp::Error(rest.to_owned()),
            ":" => Resp::Integer(rest.parse().unwrap()),
            "$" => {
                let len: usize = rest.parse().unwrap();
                let mut body = vec![0; len + 2];
                self.reader.read_exact(&mut body).await.unwrap();
                body.truncate(len);
                Resp::Bulk(String::from_utf8(body).unwrap())
            }
            other => panic!("unexpected reply type '{other}' in '{header}'"),
        }
    }

    pub async fn ok(&mut self, line: &str) {
        match self.cmd(line).await {
            Resp::Simple(s) if s == "OK" => {}
            other => panic!("expected OK for '{line}', got {other:?}"),
        }
    }

    pub async fn bulk(&mut self, line: &str) -> String {
        match self.cmd(line).await {
            Resp::Bulk(text) => text,
            other => panic!("expected bulk for '{line}', got {other:?}"),
        }
    }

    pub async fn int(&mut self, line: &str) -> i64 {
        match self.cmd(line).await {
            Resp::Integer(n) => n,
            other => panic!("expected integer for '{line}', got {other:?}"),
        }
    }

    pub async fn err(&mut self, line: &str) -> String {
        match self.cmd(line).await {
            Resp::Error(msg) => msg,
            other => panic!("expected error for '{line}', got {other:?}"),
        }
    }

    /// Polls NODES until `done` accepts it or `timeout` passes. Returns
    /// the last NODES text either way.
    pub async fn wait_for_nodes(&mut self, timeout: Duration, done: impl Fn(&str) -> bool) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let nodes = self.bulk("CLUSTER NODES").await;
            if done(&nodes) || Instant::now() > deadline {
                return nodes;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// NODES lines for completed (non-handshake) nodes.
pub fn known_nodes(nodes: &str) -> usize {
    nodes
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.contains("handshake"))
        .count()
}

/// Finds a free TCP port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cinder-server"))
}
