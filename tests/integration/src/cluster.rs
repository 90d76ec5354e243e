//! Integration tests for the admin surface and bus membership.

use std::time::Duration;

use crate::helpers::{known_nodes, Resp, TestServer};

// -- single node --

#[tokio::test]
async fn myid_and_keyslot() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let id = c.bulk("CLUSTER MYID").await;
    assert_eq!(id.len(), 40);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));

    assert_eq!(c.int("CLUSTER KEYSLOT foo").await, 12182);
    assert_eq!(
        c.int("KEYSLOT {user1000}.following").await,
        c.int("KEYSLOT {user1000}.followers").await
    );
}

#[tokio::test]
async fn fresh_node_reports_fail_until_slots_are_served() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let info = c.bulk("CLUSTER INFO").await;
    assert!(info.contains("cluster_state:fail"), "{info}");
    assert!(info.contains("cluster_known_nodes:1"), "{info}");

    let slots: Vec<String> = (0..16384).map(|s| s.to_string()).collect();
    for chunk in slots.chunks(4096) {
        c.ok(&format!("CLUSTER ADDSLOTS {}", chunk.join(" "))).await;
    }
    let info = c.bulk("CLUSTER INFO").await;
    assert!(info.contains("cluster_state:ok"), "{info}");
    assert!(info.contains("cluster_slots_assigned:16384"), "{info}");

    let nodes = c.bulk("CLUSTER NODES").await;
    assert!(nodes.contains("myself,master"));
    assert!(nodes.trim_end().ends_with("0-16383"), "{nodes}");
}

#[tokio::test]
async fn errors_are_reported_inline() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert!(c.err("CLUSTER FROBNICATE").await.starts_with("ERR"));
    assert!(c.err("CLUSTER MEET 127.0.0.1").await.contains("wrong number of arguments"));
    assert!(c.err("CLUSTER FORGET 0000000000000000000000000000000000000000").await.contains("Unknown node"));

    let id = c.bulk("CLUSTER MYID").await;
    assert!(c.err(&format!("CLUSTER REPLICATE {id}")).await.contains("replicate myself"));

    // the connection is still usable
    assert!(matches!(c.cmd("CLUSTER BUMPEPOCH").await, Resp::Simple(s) if s == "BUMPED 1"));
}

#[tokio::test]
async fn shutdown_command_stops_the_server() {
    let mut server = TestServer::start();
    let mut c = server.connect().await;

    c.ok("CLUSTER SHUTDOWN NOSAVE").await;
    let status = server
        .wait(Duration::from_secs(10))
        .expect("server should exit after SHUTDOWN");
    assert!(status.success());
}

// -- membership --

#[tokio::test]
async fn two_nodes_meet_over_tcp() {
    let a = TestServer::start();
    let b = TestServer::start();
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;

    ca.ok("CLUSTER ADDSLOTS 0 1 2").await;
    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;

    let done = |nodes: &str| known_nodes(nodes) == 2;
    let nodes_a = ca.wait_for_nodes(Duration::from_secs(10), done).await;
    let nodes_b = cb.wait_for_nodes(Duration::from_secs(10), done).await;
    assert_eq!(known_nodes(&nodes_a), 2, "{nodes_a}");
    assert_eq!(known_nodes(&nodes_b), 2, "{nodes_b}");

    // b learned a's id and slots from the bus
    let id_a = ca.bulk("CLUSTER MYID").await;
    let line = nodes_b
        .lines()
        .find(|l| l.starts_with(&id_a))
        .unwrap_or_else(|| panic!("b does not list a: {nodes_b}"));
    assert!(line.contains(&format!("127.0.0.1:{}@{}", a.port, a.bus_port)), "{line}");
    assert!(line.trim_end().ends_with("0-2"), "{line}");

    let info = cb.bulk("CLUSTER INFO").await;
    assert!(info.contains("cluster_known_nodes:2"), "{info}");
    assert!(info.contains("cluster_stats_messages_meet_received"), "{info}");
}
