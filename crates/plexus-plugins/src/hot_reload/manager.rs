//! Hot-reload manager
//!
//! Runs the reload pipeline for kernel plugins:
//! before hooks -> snapshot -> destroy -> module loader -> activate ->
//! restore -> after hooks. Any failing step stops the pipeline and is
//! reported in the [`ReloadResult`]; nothing is raised to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use plexus_kernel::Kernel;
use plexus_kernel::utils::millis;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::loader::{KeepCurrentLoader, ModuleLoader};
use super::state::StateManager;
use super::store::SnapshotStore;
use super::{HotReloadConfig, ReloadError, ReloadEvent, ReloadResult, ReloadStatus};

const EVENT_CAPACITY: usize = 1024;

/// A debounced reload waiting for its quiet period
struct PendingReload {
    ticket: u64,
    task: JoinHandle<()>,
}

/// What the pipeline got done before it finished or failed
#[derive(Default)]
struct Progress {
    snapshot_id: Option<String>,
    state_restored: bool,
}

struct ManagerInner {
    kernel: Kernel,
    config: HotReloadConfig,
    loader: Arc<dyn ModuleLoader>,
    state: StateManager,
    status: RwLock<HashMap<String, ReloadStatus>>,
    results: RwLock<HashMap<String, ReloadResult>>,
    pending: Mutex<HashMap<String, PendingReload>>,
    next_ticket: AtomicU64,
    events: broadcast::Sender<ReloadEvent>,
}

impl ManagerInner {
    fn emit(&self, event: ReloadEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, plugin: &str, status: ReloadStatus) {
        self.status.write().insert(plugin.to_string(), status);
    }

    /// Claim the plugin for one pipeline run.
    fn begin(&self, plugin: &str) -> Result<(), ReloadError> {
        if !self.config.enabled {
            return Err(ReloadError::Disabled);
        }
        if self.kernel.plugin(plugin).is_none() {
            return Err(ReloadError::PluginNotFound(plugin.to_string()));
        }
        let mut status = self.status.write();
        let entry = status.entry(plugin.to_string()).or_default();
        if *entry == ReloadStatus::Reloading {
            return Err(ReloadError::InProgress(plugin.to_string()));
        }
        *entry = ReloadStatus::Reloading;
        Ok(())
    }

    /// Remove the pending entry if it still belongs to `ticket`.
    fn take_pending(&self, plugin: &str, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(plugin) {
            Some(entry) if entry.ticket == ticket => {
                pending.remove(plugin);
                true
            }
            _ => false,
        }
    }

    async fn reload(&self, plugin: &str) -> ReloadResult {
        let began = Instant::now();
        let mut progress = Progress::default();

        if let Err(err) = self.begin(plugin) {
            warn!(plugin, error = %err, "Reload rejected");
            return ReloadResult {
                plugin: plugin.to_string(),
                success: false,
                duration: began.elapsed(),
                snapshot_id: None,
                state_restored: false,
                error: Some(err.to_string()),
            };
        }

        let outcome = self.run_pipeline(plugin, &mut progress).await;
        let duration = began.elapsed();

        let result = ReloadResult {
            plugin: plugin.to_string(),
            success: outcome.is_ok(),
            duration,
            snapshot_id: progress.snapshot_id,
            state_restored: progress.state_restored,
            error: outcome.as_ref().err().map(ToString::to_string),
        };

        match outcome {
            Ok(()) => {
                info!(plugin, duration_ms = millis(duration), "Plugin reloaded");
                self.set_status(plugin, ReloadStatus::Reloaded);
                self.emit(ReloadEvent::ReloadCompleted {
                    plugin: plugin.to_string(),
                    duration,
                });
            }
            Err(err) => {
                error!(plugin, error = %err, "Plugin reload failed");
                self.set_status(plugin, ReloadStatus::Failed(err.to_string()));
                self.emit(ReloadEvent::ReloadFailed {
                    plugin: plugin.to_string(),
                    error: err.to_string(),
                });
            }
        }

        self.results
            .write()
            .insert(plugin.to_string(), result.clone());
        result
    }

    async fn run_pipeline(&self, name: &str, progress: &mut Progress) -> Result<(), ReloadError> {
        let current = self
            .kernel
            .plugin(name)
            .ok_or_else(|| ReloadError::PluginNotFound(name.to_string()))?;
        let version = current.metadata().version.clone();

        info!(plugin = %name, version = %version, "Reloading plugin");
        self.emit(ReloadEvent::ReloadStarted {
            plugin: name.to_string(),
        });

        self.run_hooks(&self.config.before_reload_hooks, name).await;

        if self.state.strategy().preserves_state() {
            let captured =
                current
                    .snapshot_state()
                    .await
                    .map_err(|source| ReloadError::StateCapture {
                        plugin: name.to_string(),
                        source,
                    })?;
            if let Some(state) = captured {
                let snapshot_id = self.state.save_state(name, &version, state).await?;
                self.emit(ReloadEvent::StatePreserved {
                    plugin: name.to_string(),
                    snapshot_id: snapshot_id.clone(),
                });
                progress.snapshot_id = Some(snapshot_id);
            }
        }

        self.kernel
            .destroy_plugin_within(name, self.config.shutdown_timeout)
            .await?;

        let target = match self.loader.load(name, current.clone()).await? {
            Some(replacement) => {
                if replacement.name() != name {
                    return Err(ReloadError::Loader {
                        plugin: name.to_string(),
                        reason: format!("replacement is named '{}'", replacement.name()),
                    });
                }
                self.kernel.replace_plugin(name, replacement.clone())?;
                debug!(plugin = %name, "Plugin instance replaced");
                replacement
            }
            None => current,
        };

        self.kernel.activate_plugin(name).await?;

        if let Some(snapshot_id) = progress.snapshot_id.clone() {
            let target_version = target.metadata().version.clone();
            match self
                .state
                .restore_compatible(name, &snapshot_id, &target_version)
                .await
            {
                Some(state) => {
                    target
                        .restore_state(state)
                        .await
                        .map_err(|source| ReloadError::StateRestore {
                            plugin: name.to_string(),
                            source,
                        })?;
                    progress.state_restored = true;
                    self.emit(ReloadEvent::StateRestored {
                        plugin: name.to_string(),
                        snapshot_id,
                    });
                }
                None => {
                    warn!(plugin = %name, snapshot = %snapshot_id, "Plugin reloaded without its previous state");
                }
            }
        }

        self.run_hooks(&self.config.after_reload_hooks, name).await;
        Ok(())
    }

    async fn run_hooks(&self, events: &[String], plugin: &str) {
        for event in events {
            if let Err(err) = self
                .kernel
                .trigger(event, vec![Value::from(plugin)])
                .await
            {
                warn!(plugin, event = %event, error = %err, "Reload hook failed");
            }
        }
    }
}

/// Reloads kernel plugins, directly or debounced.
///
/// ```rust,ignore
/// let manager = HotReloadManager::builder(kernel.clone())
///     .config(HotReloadConfig::default().with_debounce(Duration::from_millis(200)))
///     .build()?;
/// manager.schedule_reload("db");
/// ```
#[derive(Clone)]
pub struct HotReloadManager {
    inner: Arc<ManagerInner>,
}

impl HotReloadManager {
    /// Manager with `config`, the built-in store for its state strategy and
    /// a loader that keeps the current instance.
    pub fn new(kernel: Kernel, config: HotReloadConfig) -> Result<Self, ReloadError> {
        Self::builder(kernel).config(config).build()
    }

    pub fn builder(kernel: Kernel) -> HotReloadManagerBuilder {
        HotReloadManagerBuilder {
            kernel,
            config: HotReloadConfig::default(),
            loader: Arc::new(KeepCurrentLoader),
            store: None,
        }
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.inner.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.inner.state
    }

    /// Run the pipeline for `plugin` now. Failures are reported in the
    /// result, never raised.
    pub async fn reload_plugin(&self, plugin: &str) -> ReloadResult {
        self.inner.reload(plugin).await
    }

    /// Reload `plugin` once the debounce period passes without another
    /// request for it. Returns `false` when hot reload is disabled.
    pub fn schedule_reload(&self, plugin: &str) -> bool {
        if !self.inner.config.enabled {
            debug!(plugin, "Hot reload disabled, ignoring reload request");
            return false;
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let delay = self.inner.config.debounce;

        // the task cannot claim its entry before it is inserted
        let mut pending = self.inner.pending.lock();
        let inner = self.inner.clone();
        let name = plugin.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.take_pending(&name, ticket) {
                inner.reload(&name).await;
            }
        });
        if let Some(previous) = pending.insert(plugin.to_string(), PendingReload { ticket, task }) {
            previous.task.abort();
            debug!(plugin, "Pending reload restarted");
        }
        drop(pending);

        let mut status = self.inner.status.write();
        let entry = status.entry(plugin.to_string()).or_default();
        if *entry != ReloadStatus::Reloading {
            *entry = ReloadStatus::Pending;
        }
        true
    }

    /// Drop the pending reload of `plugin`. Returns whether one was waiting.
    pub fn cancel_pending(&self, plugin: &str) -> bool {
        let Some(entry) = self.inner.pending.lock().remove(plugin) else {
            return false;
        };
        entry.task.abort();

        let mut status = self.inner.status.write();
        if status.get(plugin) == Some(&ReloadStatus::Pending) {
            status.insert(plugin.to_string(), ReloadStatus::Idle);
        }
        true
    }

    /// Drop every pending reload.
    pub fn cancel_all(&self) {
        let names: Vec<String> = self.inner.pending.lock().keys().cloned().collect();
        for name in names {
            self.cancel_pending(&name);
        }
    }

    /// Plugins with a reload waiting for its quiet period.
    pub fn pending_reloads(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pending.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn status(&self, plugin: &str) -> ReloadStatus {
        self.inner
            .status
            .read()
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    /// Result of the most recent pipeline run for `plugin`.
    pub fn last_result(&self, plugin: &str) -> Option<ReloadResult> {
        self.inner.results.read().get(plugin).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.inner.events.subscribe()
    }
}

/// Builder for [`HotReloadManager`]
pub struct HotReloadManagerBuilder {
    kernel: Kernel,
    config: HotReloadConfig,
    loader: Arc<dyn ModuleLoader>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl HotReloadManagerBuilder {
    pub fn config(mut self, config: HotReloadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Keep snapshots in `store` instead of the strategy's built-in backend.
    /// Required for `distributed`.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<HotReloadManager, ReloadError> {
        let strategy = self.config.state_strategy;
        let state = match self.store {
            Some(store) if strategy.preserves_state() => {
                StateManager::with_store(strategy, store).with_max_history(self.config.max_history)
            }
            _ => StateManager::from_config(&self.config)?,
        };
        info!(strategy = %strategy, enabled = self.config.enabled, "Hot reload manager ready");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(HotReloadManager {
            inner: Arc::new(ManagerInner {
                kernel: self.kernel,
                config: self.config,
                loader: self.loader,
                state,
                status: RwLock::new(HashMap::new()),
                results: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                events,
            }),
        })
    }
}
