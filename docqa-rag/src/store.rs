//! Persistent backing stores for user indexes.
//!
//! The registry loads a user's [`IndexSnapshot`] on first access, the
//! pipeline saves it after each successful mutation, and a clear deletes it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::document::UserId;
use crate::error::{RagError, Result};
use crate::index::IndexSnapshot;

/// Load/save/delete of per-user index snapshots.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Return the stored snapshot for `user_id`, if any.
    async fn load(&self, user_id: &UserId) -> Result<Option<IndexSnapshot>>;

    /// Replace the stored snapshot for `snapshot.user_id`.
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<()>;

    /// Remove everything stored for `user_id`. Deleting a missing user is a no-op.
    async fn delete(&self, user_id: &UserId) -> Result<()>;
}

/// Keeps snapshots in memory. Useful in tests and for a process-lifetime cache.
#[derive(Debug, Default)]
pub struct InMemoryIndexStore {
    snapshots: RwLock<HashMap<UserId, IndexSnapshot>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users with a stored snapshot.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn load(&self, user_id: &UserId) -> Result<Option<IndexSnapshot>> {
        Ok(self.snapshots.read().await.get(user_id).cloned())
    }

    async fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        self.snapshots.write().await.insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &UserId) -> Result<()> {
        self.snapshots.write().await.remove(user_id);
        Ok(())
    }
}

/// One JSON file per user in a directory.
///
/// File names are the hex encoding of the user id, so arbitrary ids cannot
/// escape the directory. Every save writes its own uniquely named temporary
/// file and renames it over the old one, so a reader never sees a partial
/// snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileIndexStore {
    dir: PathBuf,
}

const BACKEND: &str = "JsonFile";

impl JsonFileIndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &UserId) -> PathBuf {
        let mut name = String::with_capacity(user_id.as_str().len() * 2 + 5);
        for byte in user_id.as_str().bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> RagError {
    error!(backend = BACKEND, path = %path.display(), error = %e, "{action} failed");
    RagError::store(BACKEND, format!("{action} {}: {e}", path.display()))
}

#[async_trait]
impl IndexStore for JsonFileIndexStore {
    async fn load(&self, user_id: &UserId) -> Result<Option<IndexSnapshot>> {
        let path = self.path_for(user_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };

        let snapshot: IndexSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            error!(backend = BACKEND, path = %path.display(), error = %e, "corrupt snapshot");
            RagError::store(BACKEND, format!("corrupt snapshot {}: {e}", path.display()))
        })?;

        if snapshot.user_id != *user_id {
            return Err(RagError::store(
                BACKEND,
                format!("snapshot {} belongs to another user", path.display()),
            ));
        }

        debug!(user_id = %user_id, entries = snapshot.entries.len(), "loaded snapshot");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create directory", &self.dir, e))?;

        let path = self.path_for(&snapshot.user_id);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(snapshot)
            .map_err(|e| RagError::store(BACKEND, format!("serialize snapshot: {e}")))?;

        let written = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await.map_err(|e| io_error("rename", &path, e)),
            Err(e) => Err(io_error("write", &tmp, e)),
        };
        if written.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        written?;
        debug!(user_id = %snapshot.user_id, entries = snapshot.entries.len(), "saved snapshot");
        Ok(())
    }

    async fn delete(&self, user_id: &UserId) -> Result<()> {
        let path = self.path_for(user_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}
