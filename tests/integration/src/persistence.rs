//! Integration tests for node table persistence and recovery.

use std::time::Duration;

use crate::helpers::{Resp, ServerOptions, TestServer};

#[tokio::test]
async fn node_table_survives_restart() {
    let data_dir = tempfile::tempdir().unwrap();
    let path = data_dir.path().to_path_buf();

    let id = {
        let server = TestServer::start_with(ServerOptions {
            data_dir_path: Some(path.clone()),
            ..Default::default()
        });
        let mut c = server.connect().await;

        c.ok("CLUSTER ADDSLOTS 100 101 102 5000").await;
        assert_eq!(c.cmd("CLUSTER BUMPEPOCH").await, Resp::Simple("BUMPED 1".into()));
        c.ok("CLUSTER SAVECONFIG").await;
        c.bulk("CLUSTER MYID").await
    };
    // server killed on drop, but data_dir still alive
    assert!(path.join("nodes.conf").exists());

    let server = TestServer::start_with(ServerOptions {
        data_dir_path: Some(path.clone()),
        ..Default::default()
    });
    let mut c = server.connect().await;

    assert_eq!(c.bulk("CLUSTER MYID").await, id);
    let nodes = c.bulk("CLUSTER NODES").await;
    assert!(nodes.trim_end().ends_with("100-102 5000"), "{nodes}");
    // config epoch already set and the highest known: nothing to bump
    assert_eq!(c.cmd("CLUSTER BUMPEPOCH").await, Resp::Simple("STILL 1".into()));

    drop(data_dir);
}

#[tokio::test]
async fn graceful_shutdown_saves() {
    let data_dir = tempfile::tempdir().unwrap();
    let path = data_dir.path().to_path_buf();

    let mut server = TestServer::start_with(ServerOptions {
        data_dir_path: Some(path.clone()),
        ..Default::default()
    });
    let mut c = server.connect().await;
    let id = c.bulk("CLUSTER MYID").await;
    c.ok("CLUSTER SHUTDOWN").await;
    assert!(server.wait(Duration::from_secs(10)).is_some());

    let saved = std::fs::read_to_string(path.join("nodes.conf")).unwrap();
    assert!(saved.starts_with(&id), "{saved}");
    assert!(saved.contains("myself,master"));
    assert!(saved.trim_end().ends_with("lastVoteEpoch 0"));
}

#[tokio::test]
async fn corrupt_node_table_refuses_to_start() {
    let data_dir = tempfile::tempdir().unwrap();
    std::fs::write(data_dir.path().join("nodes.conf"), "this is not a node table\n").unwrap();

    let status = TestServer::start_expecting_exit(ServerOptions {
        data_dir_path: Some(data_dir.path().to_path_buf()),
        ..Default::default()
    });
    assert!(!status.success());
}
