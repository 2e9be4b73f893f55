//! Hot-reload support for kernel-managed plugins
//!
//! Provides:
//! - State snapshots with integrity checksums, kept across reloads
//! - Pluggable snapshot persistence (memory, disk, user supplied)
//! - A debounced per-plugin reload pipeline
//! - File watching that maps changed files to plugin reloads
//!
//! The actual code swap is delegated to a [`ModuleLoader`]; this module only
//! orchestrates hooks, state and the kernel lifecycle around it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use plexus_kernel::utils::duration_ms;
use plexus_kernel::{KernelError, PluginError};
use serde::{Deserialize, Serialize};

mod loader;
mod manager;
mod state;
mod store;
mod watcher;

pub use loader::{KeepCurrentLoader, ModuleLoader};
pub use manager::{HotReloadManager, HotReloadManagerBuilder};
pub use state::{PluginStateSnapshot, SnapshotInfo, StateManager, checksum};
pub use store::{DiskSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use watcher::{PluginWatcher, matches_pattern};

/// Hook fired (best-effort) before a plugin is torn down for reload
pub const BEFORE_RELOAD: &str = "plugin:before-reload";
/// Hook fired (best-effort) once the reloaded plugin is running again
pub const AFTER_RELOAD: &str = "plugin:after-reload";

// ============================================================================
// Configuration
// ============================================================================

/// Where snapshots taken before a reload are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateStrategy {
    /// In-process map, lost on exit
    #[default]
    Memory,
    /// One JSON file per snapshot under `state_dir`
    Disk,
    /// A caller-provided [`SnapshotStore`]
    Distributed,
    /// State is not preserved across reloads
    None,
}

impl StateStrategy {
    pub fn preserves_state(&self) -> bool {
        !matches!(self, StateStrategy::None)
    }
}

impl fmt::Display for StateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStrategy::Memory => write!(f, "memory"),
            StateStrategy::Disk => write!(f, "disk"),
            StateStrategy::Distributed => write!(f, "distributed"),
            StateStrategy::None => write!(f, "none"),
        }
    }
}

/// Hot-reload settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// File patterns (`*.ext`, `prefix*`, exact names) used for plugins
    /// watched without their own patterns
    pub watch_patterns: Vec<String>,
    /// File patterns never treated as a change
    pub ignore_patterns: Vec<String>,
    /// Watch directories recursively
    pub recursive: bool,
    pub state_strategy: StateStrategy,
    /// Directory for [`StateStrategy::Disk`]
    pub state_dir: Option<PathBuf>,
    /// Snapshots kept per plugin, newest included
    pub max_history: usize,
    /// Quiet period before a scheduled reload fires
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    /// Deadline for destroying the old instance
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Hook events triggered before teardown
    pub before_reload_hooks: Vec<String>,
    /// Hook events triggered after the plugin runs again
    pub after_reload_hooks: Vec<String>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_patterns: Vec::new(),
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
            recursive: false,
            state_strategy: StateStrategy::Memory,
            state_dir: None,
            max_history: 10,
            debounce: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            before_reload_hooks: vec![BEFORE_RELOAD.to_string()],
            after_reload_hooks: vec![AFTER_RELOAD.to_string()],
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_watch_pattern(mut self, pattern: &str) -> Self {
        self.watch_patterns.push(pattern.to_string());
        self
    }

    pub fn with_ignore(mut self, pattern: &str) -> Self {
        self.ignore_patterns.push(pattern.to_string());
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_state_strategy(mut self, strategy: StateStrategy) -> Self {
        self.state_strategy = strategy;
        self
    }

    /// Persist snapshots as JSON files under `dir`.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_strategy = StateStrategy::Disk;
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max.max(1);
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_before_reload_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before_reload_hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_after_reload_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after_reload_hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn preserve_state(&self) -> bool {
        self.state_strategy.preserves_state()
    }
}

// ============================================================================
// Status, events and results
// ============================================================================

/// Where a plugin stands in the reload pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ReloadStatus {
    /// Never reloaded
    #[default]
    Idle,
    /// A debounced reload is waiting for its quiet period
    Pending,
    Reloading,
    /// Last reload completed
    Reloaded,
    /// Last reload failed; the plugin may be left destroyed
    Failed(String),
}

impl fmt::Display for ReloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadStatus::Idle => write!(f, "idle"),
            ReloadStatus::Pending => write!(f, "pending"),
            ReloadStatus::Reloading => write!(f, "reloading"),
            ReloadStatus::Reloaded => write!(f, "reloaded"),
            ReloadStatus::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Published by [`HotReloadManager::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReloadEvent {
    ReloadStarted {
        plugin: String,
    },
    StatePreserved {
        plugin: String,
        snapshot_id: String,
    },
    StateRestored {
        plugin: String,
        snapshot_id: String,
    },
    ReloadCompleted {
        plugin: String,
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    ReloadFailed {
        plugin: String,
        error: String,
    },
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResult {
    pub plugin: String,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Snapshot taken before teardown
    pub snapshot_id: Option<String>,
    /// Whether the snapshot made it back into the new instance
    pub state_restored: bool,
    pub error: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Hot-reload errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReloadError {
    #[error("hot reload is disabled")]
    Disabled,

    #[error("plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("plugin '{0}' is already reloading")]
    InProgress(String),

    #[error("capturing state of '{plugin}' failed: {source}")]
    StateCapture {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("restoring state of '{plugin}' failed: {source}")]
    StateRestore {
        plugin: String,
        #[source]
        source: PluginError,
    },

    /// A snapshot backend could not store, fetch or decode a snapshot.
    #[error("snapshot store error: {0}")]
    Store(String),

    /// Raised by [`ModuleLoader`] implementations, and for a replacement
    /// that does not carry the plugin's name.
    #[error("module loader failed for '{plugin}': {reason}")]
    Loader { plugin: String, reason: String },

    #[error("state strategy '{0}' needs {1}")]
    Misconfigured(StateStrategy, &'static str),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = HotReloadConfig::default();
        assert!(config.enabled);
        assert!(config.preserve_state());
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.before_reload_hooks, vec![BEFORE_RELOAD]);
        assert!(!HotReloadConfig::default()
            .with_state_strategy(StateStrategy::None)
            .preserve_state());
    }

    #[test]
    fn config_deserializes_strategy_and_millis() {
        let config: HotReloadConfig = serde_json::from_str(
            r#"{ "state_strategy": "disk", "state_dir": "/tmp/snapshots", "debounce": 50 }"#,
        )
        .unwrap();
        assert_eq!(config.state_strategy, StateStrategy::Disk);
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.max_history, 10);
    }

    #[test]
    fn status_serializes_with_error() {
        let json = serde_json::to_value(ReloadStatus::Failed("boom".into())).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(ReloadStatus::Reloading.to_string(), "reloading");
    }
}
