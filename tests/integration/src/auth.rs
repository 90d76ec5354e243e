//! Integration tests for bus authentication.

use std::time::Duration;

use crate::helpers::{known_nodes, ServerOptions, TestServer};

fn with_secret(pass: &str) -> TestServer {
    TestServer::start_with(ServerOptions {
        auth_pass: Some(pass.into()),
        ..Default::default()
    })
}

#[tokio::test]
async fn nodes_sharing_a_secret_meet() {
    let a = with_secret("s3cret");
    let b = with_secret("s3cret");
    let mut ca = a.connect().await;

    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    let nodes = ca
        .wait_for_nodes(Duration::from_secs(10), |n| known_nodes(n) == 2)
        .await;
    assert_eq!(known_nodes(&nodes), 2, "{nodes}");
}

#[tokio::test]
async fn mismatched_secret_never_completes_the_handshake() {
    let a = with_secret("one");
    let b = with_secret("two");
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;

    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let nodes_a = ca.bulk("CLUSTER NODES").await;
    assert_eq!(known_nodes(&nodes_a), 1, "{nodes_a}");
    assert!(nodes_a.contains("handshake"), "{nodes_a}");
    assert_eq!(known_nodes(&cb.bulk("CLUSTER NODES").await), 1);
}

#[tokio::test]
async fn unauthenticated_node_is_ignored() {
    let a = with_secret("s3cret");
    let b = TestServer::start();
    let mut cb = b.connect().await;

    // b talks to a without a tag; a drops the frames
    cb.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", a.port, a.bus_port))
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut ca = a.connect().await;
    assert_eq!(known_nodes(&ca.bulk("CLUSTER NODES").await), 1);
    assert_eq!(known_nodes(&cb.bulk("CLUSTER NODES").await), 1);
}
