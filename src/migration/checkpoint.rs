//! Migration checkpoint persistence (spec §4.4). Generalizes the teacher's
//! atomic rotation discipline in `ledger::rotate_and_cleanup` (which renames
//! a rotated ledger file into place) into a write-temp-then-rename update of
//! a single evolving checkpoint file.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Periodic snapshot of a migration run: which files are fully processed,
/// how far into each in-flight file processing reached, and which
/// append-only record uuids have already been committed (so resume does
/// not double-insert into tables that aren't replacing-on-key).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed_files: HashSet<String>,
    pub last_committed_line: HashMap<String, usize>,
    pub committed_uuids: HashMap<String, HashSet<Uuid>>,
    pub records_done: u64,
    pub tokens_done: u64,
    pub files_done: u64,
    pub errors: Vec<String>,
}

impl Checkpoint {
    pub fn resume_line_for(&self, file_key: &str) -> usize {
        self.last_committed_line.get(file_key).copied().unwrap_or(0)
    }

    pub fn already_committed(&self, file_key: &str, uuid: Uuid) -> bool {
        self.committed_uuids.get(file_key).map(|set| set.contains(&uuid)).unwrap_or(false)
    }

    pub fn mark_committed(&mut self, file_key: &str, uuid: Uuid) {
        self.committed_uuids.entry(file_key.to_string()).or_default().insert(uuid);
    }
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path_buf(&self) -> PathBuf {
        self.path.clone()
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, Error> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Clears the checkpoint on successful finalization (spec §4.4
    /// Finalization: "clears transient checkpoints older than a retention
    /// horizon" — a completed run clears immediately).
    pub async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        let mut checkpoint = Checkpoint::default();
        checkpoint.last_committed_line.insert("a.jsonl".to_string(), 500);
        checkpoint.records_done = 500;
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.resume_line_for("a.jsonl"), 500);
        assert_eq!(loaded.records_done, 500);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&Checkpoint::default()).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn committed_uuid_tracking_prevents_duplicate_append() {
        let mut checkpoint = Checkpoint::default();
        let id = Uuid::new_v4();
        assert!(!checkpoint.already_committed("a.jsonl", id));
        checkpoint.mark_committed("a.jsonl", id);
        assert!(checkpoint.already_committed("a.jsonl", id));
    }
}
