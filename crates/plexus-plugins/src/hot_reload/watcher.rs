//! File system watcher for plugin changes
//!
//! Maps changed files to the plugins whose watch patterns match them and
//! schedules a debounced reload for each.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{HotReloadManager, ReloadError};

/// Match a file name against `*`, `*.ext`, `prefix*` or an exact name.
pub fn matches_pattern(pattern: &str, file_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return file_name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return file_name.starts_with(prefix);
    }
    file_name == pattern
}

#[derive(Debug, Clone)]
struct WatchRoute {
    plugin: String,
    patterns: Vec<String>,
}

/// Plugin file watcher
///
/// Tracks which plugin each file pattern belongs to; `start` hooks it up to
/// `notify` for a set of directories.
pub struct PluginWatcher {
    manager: HotReloadManager,
    routes: Arc<RwLock<Vec<WatchRoute>>>,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
    watch_paths: Vec<PathBuf>,
}

impl PluginWatcher {
    pub fn new(manager: HotReloadManager) -> Self {
        Self {
            manager,
            routes: Arc::new(RwLock::new(Vec::new())),
            watcher: None,
            task: None,
            watch_paths: Vec::new(),
        }
    }

    /// Reload `plugin` when a file matching one of `patterns` changes. An
    /// empty list falls back to the configured `watch_patterns`.
    pub fn track<I, S>(&self, plugin: &str, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            patterns = self.manager.config().watch_patterns.clone();
        }
        if patterns.is_empty() {
            warn!(plugin, "No watch patterns, file changes will not reload this plugin");
        }

        let mut routes = self.routes.write();
        routes.retain(|route| route.plugin != plugin);
        routes.push(WatchRoute {
            plugin: plugin.to_string(),
            patterns,
        });
    }

    pub fn untrack(&self, plugin: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|route| route.plugin != plugin);
        routes.len() != before
    }

    /// Plugins that a change to `path` should reload.
    pub fn plugins_for(&self, path: &Path) -> Vec<String> {
        plugins_for(&self.routes.read(), &self.manager, path)
    }

    /// Schedule a reload for every plugin matching `path`; returns how many
    /// were scheduled.
    pub fn handle_change(&self, path: &Path) -> usize {
        handle_change(&self.routes, &self.manager, path)
    }

    /// Start watching `paths`. Missing paths are skipped with a warning.
    pub fn start<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), ReloadError> {
        if self.watcher.is_some() {
            debug!("Plugin watcher already running");
            return Ok(());
        }
        info!("Starting plugin watcher");

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let watcher_config = Config::default().with_poll_interval(Duration::from_millis(100));
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!(error = %err, "File watch error"),
            },
            watcher_config,
        )?;

        let mode = if self.manager.config().recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                warn!(path = %path.display(), "Watch path does not exist");
                continue;
            }
            watcher.watch(path, mode)?;
            self.watch_paths.push(path.to_path_buf());
        }

        let routes = self.routes.clone();
        let manager = self.manager.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !is_change(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    handle_change(&routes, &manager, path);
                }
            }
            debug!("Plugin watcher event stream closed");
        }));
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopping plugin watcher");
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.watch_paths.clear();
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watch_paths
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Content changes, creations and rename targets count; removals do not.
fn is_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Name(mode)) => {
            matches!(mode, RenameMode::To | RenameMode::Both)
        }
        EventKind::Modify(_) => true,
        _ => false,
    }
}

fn plugins_for(routes: &[WatchRoute], manager: &HotReloadManager, path: &Path) -> Vec<String> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let ignored = manager
        .config()
        .ignore_patterns
        .iter()
        .any(|pattern| matches_pattern(pattern, file_name));
    if ignored {
        return Vec::new();
    }

    routes
        .iter()
        .filter(|route| {
            route
                .patterns
                .iter()
                .any(|pattern| matches_pattern(pattern, file_name))
        })
        .map(|route| route.plugin.clone())
        .collect()
}

fn handle_change(
    routes: &RwLock<Vec<WatchRoute>>,
    manager: &HotReloadManager,
    path: &Path,
) -> usize {
    let plugins = plugins_for(&routes.read(), manager, path);
    let mut scheduled = 0;
    for plugin in plugins {
        debug!(plugin = %plugin, path = %path.display(), "Plugin file changed");
        if manager.schedule_reload(&plugin) {
            scheduled += 1;
        }
    }
    scheduled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_forms() {
        assert!(matches_pattern("*.wasm", "auth.wasm"));
        assert!(!matches_pattern("*.wasm", "auth.wasm.bak"));
        assert!(matches_pattern("auth*", "auth_v2.so"));
        assert!(!matches_pattern("auth*", "oauth.so"));
        assert!(matches_pattern("config.yaml", "config.yaml"));
        assert!(!matches_pattern("config.yaml", "config.yml"));
        assert!(matches_pattern("*", "anything"));
    }

    #[test]
    fn change_kinds() {
        use notify::event::{CreateKind, DataChange, RemoveKind};

        assert!(is_change(&EventKind::Create(CreateKind::File)));
        assert!(is_change(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(is_change(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(!is_change(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!is_change(&EventKind::Remove(RemoveKind::File)));
    }
}
