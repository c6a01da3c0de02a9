//! File-State Cursor persistence (spec §3, §4.3.3). Encrypted at rest with
//! `crypto::EncryptionKey` the same way the teacher optionally encrypts
//! ledger content; persisted with write-temp-then-rename, matching the
//! teacher's atomic rotation discipline in `ledger::rotate_and_cleanup`.
//! Single-writer-per-path is enforced with a per-path lock, per spec §5.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::crypto::EncryptionKey;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub mtime: i64,
}

impl FileCursor {
    /// A file is unchanged since last visit iff `(size, mtime)` match.
    pub fn unchanged(&self, size: u64, mtime: i64) -> bool {
        self.size_bytes == size && self.mtime == mtime
    }
}

pub struct CursorStore {
    path: PathBuf,
    key: EncryptionKey,
    cursors: RwLock<HashMap<String, FileCursor>>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    save_lock: Mutex<()>,
}

impl CursorStore {
    /// Loads the encrypted cursor map from `path`, or starts empty if the
    /// file does not exist yet.
    pub async fn load(path: PathBuf, key: EncryptionKey) -> Result<Self, Error> {
        let cursors = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let decrypted = key
                    .decrypt(content.trim())
                    .ok_or_else(|| Error::decode(format!("cannot decrypt cursor store at {}", path.display())))?;
                serde_json::from_str(&decrypted)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::from(e)),
        };

        Ok(Self {
            path,
            key,
            cursors: RwLock::new(cursors),
            path_locks: Mutex::new(HashMap::new()),
            save_lock: Mutex::new(()),
        })
    }

    pub async fn get(&self, file_path: &str) -> Option<FileCursor> {
        self.cursors.read().await.get(file_path).copied()
    }

    async fn lock_for(&self, file_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks.entry(file_path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Updates the cursor for `file_path` and persists the whole map.
    /// Serialized per-path so two concurrent tailers for the same file
    /// cannot interleave their cursor advances.
    #[instrument(skip(self), fields(file_path))]
    pub async fn update(&self, file_path: &str, cursor: FileCursor) -> Result<(), Error> {
        let path_lock = self.lock_for(file_path).await;
        let _guard = path_lock.lock().await;

        {
            let mut cursors = self.cursors.write().await;
            cursors.insert(file_path.to_string(), cursor);
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), Error> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.cursors.read().await.clone();
        let json = serde_json::to_string(&snapshot)?;
        let encrypted = self
            .key
            .encrypt(&json)
            .map_err(|e| Error::Permanent(format!("cursor encryption failed: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, encrypted).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
