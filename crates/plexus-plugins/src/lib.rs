//! Plugin-side services built on the Plexus kernel.
//!
//! - [`hot_reload`]: debounced, state-preserving plugin reloads and the file
//!   watcher that triggers them

pub mod hot_reload;

pub use hot_reload::{
    HotReloadConfig, HotReloadManager, ModuleLoader, PluginStateSnapshot, PluginWatcher,
    ReloadError, ReloadEvent, ReloadResult, ReloadStatus, SnapshotStore, StateManager,
    StateStrategy,
};
pub use plexus_kernel::{Plugin, PluginContext, PluginError, PluginMetadata, PluginResult};
