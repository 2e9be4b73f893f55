//! Snapshot persistence backends

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::ReloadError;
use super::state::PluginStateSnapshot;

/// Storage for [`PluginStateSnapshot`]s, keyed by plugin and snapshot id.
///
/// Implement this for a shared backend (a database, an object store) to use
/// [`StateStrategy::Distributed`](super::StateStrategy::Distributed).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store `snapshot`, replacing any snapshot with the same id.
    async fn put(&self, snapshot: &PluginStateSnapshot) -> Result<(), ReloadError>;

    async fn get(
        &self,
        plugin_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<PluginStateSnapshot>, ReloadError>;

    /// Removing a missing snapshot is not an error.
    async fn delete(&self, plugin_id: &str, snapshot_id: &str) -> Result<(), ReloadError>;
}

/// Process-local snapshot map
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, String), PluginStateSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &PluginStateSnapshot) -> Result<(), ReloadError> {
        self.snapshots.write().insert(
            (snapshot.plugin_id.clone(), snapshot.id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn get(
        &self,
        plugin_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<PluginStateSnapshot>, ReloadError> {
        Ok(self
            .snapshots
            .read()
            .get(&(plugin_id.to_string(), snapshot_id.to_string()))
            .cloned())
    }

    async fn delete(&self, plugin_id: &str, snapshot_id: &str) -> Result<(), ReloadError> {
        self.snapshots
            .write()
            .remove(&(plugin_id.to_string(), snapshot_id.to_string()));
        Ok(())
    }
}

/// One pretty-printed JSON file per snapshot: `<dir>/<plugin>/<snapshot>.json`
#[derive(Debug, Clone)]
pub struct DiskSnapshotStore {
    dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a snapshot is (or would be) stored in.
    pub fn path_for(&self, plugin_id: &str, snapshot_id: &str) -> PathBuf {
        self.dir
            .join(file_component(plugin_id))
            .join(format!("{}.json", file_component(snapshot_id)))
    }
}

/// Keep ids from escaping the store directory.
fn file_component(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn store_error(path: &Path, err: impl Display) -> ReloadError {
    ReloadError::Store(format!("{}: {err}", path.display()))
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn put(&self, snapshot: &PluginStateSnapshot) -> Result<(), ReloadError> {
        let path = self.path_for(&snapshot.plugin_id, &snapshot.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| store_error(&path, e))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| store_error(&path, e))?;
        debug!(path = %path.display(), "Snapshot persisted");
        Ok(())
    }

    async fn get(
        &self,
        plugin_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<PluginStateSnapshot>, ReloadError> {
        let path = self.path_for(plugin_id, snapshot_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(store_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| store_error(&path, e))
    }

    async fn delete(&self, plugin_id: &str, snapshot_id: &str) -> Result<(), ReloadError> {
        let path = self.path_for(plugin_id, snapshot_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(store_error(&path, err)),
        }
    }
}
