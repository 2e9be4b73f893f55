//! Plugin state preservation across reloads
//!
//! A snapshot carries the plugin's opaque JSON state plus a SHA-256 checksum
//! of that payload. Restoring re-computes the checksum and refuses snapshots
//! that no longer match.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use plexus_kernel::utils::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{DiskSnapshotStore, MemorySnapshotStore, SnapshotStore};
use super::{HotReloadConfig, ReloadError, StateStrategy};

/// Hex encoded SHA-256 of the compact JSON form of `state`.
pub fn checksum(state: &Value) -> String {
    let digest = Sha256::digest(state.to_string().as_bytes());
    hex::encode(digest)
}

/// A checksummed capture of one plugin's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStateSnapshot {
    pub id: String,
    pub plugin_id: String,
    /// Plugin version at capture time
    pub version: String,
    /// Milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
    pub state: Value,
    pub checksum: String,
}

impl PluginStateSnapshot {
    pub fn new(plugin_id: &str, version: &str, state: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            timestamp_ms: now_ms(),
            checksum: checksum(&state),
            state,
        }
    }

    /// Whether the payload still matches its checksum.
    pub fn verify(&self) -> bool {
        checksum(&self.state) == self.checksum
    }

    /// Same major version (`1.x` restores into `1.y`).
    pub fn is_compatible(&self, version: &str) -> bool {
        self.version.split('.').next() == version.split('.').next()
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id.clone(),
            version: self.version.clone(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// History entry for a saved snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub version: String,
    pub timestamp_ms: u64,
}

/// Saves and restores plugin snapshots through a [`SnapshotStore`].
///
/// Keeps the newest `max_history` snapshot ids per plugin; older snapshots
/// are removed from the store as new ones are saved.
pub struct StateManager {
    strategy: StateStrategy,
    store: Option<Arc<dyn SnapshotStore>>,
    history: RwLock<HashMap<String, VecDeque<SnapshotInfo>>>,
    max_history: usize,
}

impl StateManager {
    /// In-memory snapshots.
    pub fn new() -> Self {
        Self::with_store(StateStrategy::Memory, Arc::new(MemorySnapshotStore::new()))
    }

    /// Snapshots kept in `store`, labelled with `strategy`.
    pub fn with_store(strategy: StateStrategy, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            strategy,
            store: Some(store),
            history: RwLock::new(HashMap::new()),
            max_history: 10,
        }
    }

    /// Manager that never keeps state.
    pub fn disabled() -> Self {
        Self {
            strategy: StateStrategy::None,
            store: None,
            history: RwLock::new(HashMap::new()),
            max_history: 0,
        }
    }

    /// Build the store `config.state_strategy` names. `Distributed` has no
    /// built-in backend and must come through [`StateManager::with_store`].
    pub fn from_config(config: &HotReloadConfig) -> Result<Self, ReloadError> {
        let manager = match config.state_strategy {
            StateStrategy::Memory => Self::new(),
            StateStrategy::Disk => {
                let dir = config
                    .state_dir
                    .clone()
                    .ok_or(ReloadError::Misconfigured(StateStrategy::Disk, "state_dir"))?;
                Self::with_store(StateStrategy::Disk, Arc::new(DiskSnapshotStore::new(dir)))
            }
            StateStrategy::Distributed => {
                return Err(ReloadError::Misconfigured(
                    StateStrategy::Distributed,
                    "a snapshot store",
                ));
            }
            StateStrategy::None => Self::disabled(),
        };
        Ok(manager.with_max_history(config.max_history))
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max.max(1);
        self
    }

    pub fn strategy(&self) -> StateStrategy {
        self.strategy
    }

    /// Capture `state` for `plugin_id` and return the new snapshot id.
    pub async fn save_state(
        &self,
        plugin_id: &str,
        version: &str,
        state: Value,
    ) -> Result<String, ReloadError> {
        let store = self.store()?;
        let snapshot = PluginStateSnapshot::new(plugin_id, version, state);
        store.put(&snapshot).await?;

        let evicted = {
            let mut history = self.history.write();
            let entries = history.entry(plugin_id.to_string()).or_default();
            entries.push_back(snapshot.info());
            let excess = entries.len().saturating_sub(self.max_history);
            entries.drain(..excess).collect::<Vec<_>>()
        };
        for old in evicted {
            if let Err(err) = store.delete(plugin_id, &old.id).await {
                warn!(plugin = %plugin_id, snapshot = %old.id, error = %err, "Failed to drop old snapshot");
            }
        }

        info!(
            plugin = %plugin_id,
            snapshot = %snapshot.id,
            strategy = %self.strategy,
            "Plugin state saved"
        );
        Ok(snapshot.id)
    }

    /// State of snapshot `snapshot_id`, or `None` when it is missing, belongs
    /// to another plugin or fails its checksum. Problems are logged, never
    /// returned.
    pub async fn restore_state(&self, plugin_id: &str, snapshot_id: &str) -> Option<Value> {
        self.load_verified(plugin_id, snapshot_id)
            .await
            .map(|snapshot| snapshot.state)
    }

    /// [`StateManager::restore_state`] that also refuses snapshots taken
    /// under a different major version than `version`.
    pub async fn restore_compatible(
        &self,
        plugin_id: &str,
        snapshot_id: &str,
        version: &str,
    ) -> Option<Value> {
        let snapshot = self.load_verified(plugin_id, snapshot_id).await?;
        if !snapshot.is_compatible(version) {
            error!(
                plugin = %plugin_id,
                snapshot = %snapshot_id,
                saved = %snapshot.version,
                current = %version,
                "Snapshot version incompatible, refusing to restore"
            );
            return None;
        }
        Some(snapshot.state)
    }

    async fn load_verified(
        &self,
        plugin_id: &str,
        snapshot_id: &str,
    ) -> Option<PluginStateSnapshot> {
        let store = self.store.as_ref()?;
        let snapshot = match store.get(plugin_id, snapshot_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(plugin = %plugin_id, snapshot = %snapshot_id, "Snapshot not found");
                return None;
            }
            Err(err) => {
                error!(plugin = %plugin_id, snapshot = %snapshot_id, error = %err, "Failed to load snapshot");
                return None;
            }
        };

        if snapshot.plugin_id != plugin_id {
            error!(
                plugin = %plugin_id,
                owner = %snapshot.plugin_id,
                snapshot = %snapshot_id,
                "Snapshot belongs to another plugin"
            );
            return None;
        }
        if !snapshot.verify() {
            error!(
                plugin = %plugin_id,
                snapshot = %snapshot_id,
                "Snapshot checksum mismatch, refusing to restore"
            );
            return None;
        }

        debug!(plugin = %plugin_id, snapshot = %snapshot_id, "Plugin state restored");
        Some(snapshot)
    }

    /// State of the newest snapshot for `plugin_id`.
    pub async fn restore_latest(&self, plugin_id: &str) -> Option<Value> {
        let id = self.latest(plugin_id)?.id;
        self.restore_state(plugin_id, &id).await
    }

    pub fn latest(&self, plugin_id: &str) -> Option<SnapshotInfo> {
        self.history
            .read()
            .get(plugin_id)
            .and_then(|entries| entries.back().cloned())
    }

    /// Saved snapshots for `plugin_id`, oldest first.
    pub fn history(&self, plugin_id: &str) -> Vec<SnapshotInfo> {
        self.history
            .read()
            .get(plugin_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget and delete every snapshot of `plugin_id`.
    pub async fn clear(&self, plugin_id: &str) {
        let entries = self.history.write().remove(plugin_id).unwrap_or_default();
        let Some(store) = &self.store else {
            return;
        };
        for entry in entries {
            if let Err(err) = store.delete(plugin_id, &entry.id).await {
                warn!(plugin = %plugin_id, snapshot = %entry.id, error = %err, "Failed to delete snapshot");
            }
        }
    }

    fn store(&self) -> Result<&Arc<dyn SnapshotStore>, ReloadError> {
        self.store
            .as_ref()
            .ok_or(ReloadError::Misconfigured(StateStrategy::None, "a snapshot store"))
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
