//! The node table file (`nodes-<port>.conf`).
//!
//! Saves go to a `.tmp` sibling first and are renamed over the real file
//! once synced, so a crash mid-write never leaves a torn table behind.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cinder_cluster::{NodeTable, NodeTableStore};
use tracing::debug;

/// Persists node table snapshots to a file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NodeTableStore for FileStore {
    fn save(&mut self, table: &NodeTable) -> io::Result<()> {
        write_atomic(&self.path, table.to_string().as_bytes())?;
        debug!(path = %self.path.display(), nodes = table.nodes.len(), "node table saved");
        Ok(())
    }
}

/// Loads the node table at `path`. A missing or empty file is `None`.
pub fn load(path: &Path) -> io::Result<Option<NodeTable>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    text.parse::<NodeTable>()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = File::create(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    let result = result.and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cinder_cluster::{ClusterConfig, ClusterState};

    use super::*;

    fn state_with_slots() -> ClusterState {
        let config = Arc::new(ClusterConfig {
            announce_ip: Some("127.0.0.1".parse().unwrap()),
            announce_port: 7000,
            ..ClusterConfig::default()
        });
        let mut state = ClusterState::new(config, 1).unwrap();
        let me = state.myself_id();
        for slot in 0..100 {
            state.add_slot(slot, me);
        }
        state.current_epoch = 4;
        state
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes-7000.conf");
        let state = state_with_slots();

        let mut store = FileStore::new(&path);
        store.save(&state.snapshot()).unwrap();

        let table = load(&path).unwrap().unwrap();
        assert_eq!(table, state.snapshot());
        assert_eq!(table.current_epoch, 4);
        assert_eq!(table.myself().unwrap().id, state.myself_id());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("vars currentEpoch 4 lastVoteEpoch 0\n"));
        assert!(!dir.path().join("nodes-7000.conf.tmp").exists());
    }

    #[test]
    fn restore_from_saved_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.conf");
        let state = state_with_slots();
        FileStore::new(&path).save(&state.snapshot()).unwrap();

        let table = load(&path).unwrap().unwrap();
        let restored = ClusterState::restore(state.config().clone(), &table, 2).unwrap();
        assert_eq!(restored.myself_id(), state.myself_id());
        assert_eq!(restored.current_epoch, 4);
        assert_eq!(restored.slots.count_owned_by(&state.myself_id()), 100);
    }

    #[test]
    fn missing_or_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.conf");
        assert!(load(&path).unwrap().is_none());

        fs::write(&path, "\n  \n").unwrap();
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.conf");
        fs::write(&path, "vars currentEpoch 1 lastVoteEpoch 0\nnot a node line\n").unwrap();

        let err = load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn failed_save_leaves_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.conf");
        let state = state_with_slots();
        FileStore::new(&path).save(&state.snapshot()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let mut broken = FileStore::new(dir.path().join("missing-dir").join("nodes.conf"));
        assert!(broken.save(&state.snapshot()).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
