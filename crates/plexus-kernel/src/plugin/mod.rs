use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::context::PluginContext;

pub mod error;
pub use error::PluginError;

/// Plugin callback result type using the typed [`PluginError`].
pub type PluginResult<T> = Result<T, PluginError>;

// ============================================================================
// Plugin contract
// ============================================================================

/// A named, versioned unit of functionality driven by the kernel.
///
/// The kernel calls `init` for every plugin in dependency order, then `start`
/// in the same order, and `destroy` in reverse start order during rollback or
/// shutdown. All callbacks take `&self`: plugins that keep mutable state use
/// interior mutability, which also lets the health monitor and hot-reload
/// manager talk to a running plugin while the kernel holds it.
///
/// Every callback is raced against a deadline. When the deadline wins the
/// callback's future is dropped, so a plugin is cancelled at its next
/// suspension point; side effects it already performed are kept.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Static description: name, version, dependencies, startup timeout.
    fn metadata(&self) -> &PluginMetadata;

    /// Unique plugin name (convenience method)
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Allocate resources, register services and hooks.
    async fn init(&self, ctx: &PluginContext) -> PluginResult<()>;

    /// Begin doing work. Runs only after every plugin finished `init`.
    async fn start(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Release resources. Called at most once per successful activation.
    async fn destroy(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Liveness probe used by `Kernel::check_plugin_health` and the health
    /// monitor. `Ok(false)` and `Err(_)` both count as failing.
    async fn health_check(&self) -> PluginResult<bool> {
        Ok(true)
    }

    /// Capture in-memory state ahead of a hot reload. `None` means stateless.
    async fn snapshot_state(&self) -> PluginResult<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Re-apply state captured by [`Plugin::snapshot_state`].
    async fn restore_state(&self, _state: serde_json::Value) -> PluginResult<()> {
        Ok(())
    }
}

// ============================================================================
// Plugin metadata
// ============================================================================

/// Plugin metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin name
    pub name: String,
    /// Semantic version
    pub version: String,
    /// Human readable description
    pub description: String,
    /// Names of plugins that must be initialised and started first
    pub dependencies: Vec<String>,
    /// Per-plugin deadline for every lifecycle phase; the kernel-wide
    /// default applies when unset
    #[serde(default, with = "crate::utils::duration_ms::option")]
    pub startup_timeout: Option<Duration>,
}

impl PluginMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "0.0.0".to_string(),
            description: String::new(),
            dependencies: Vec::new(),
            startup_timeout: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.dependencies.push(dep.to_string());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Lifecycle phases
// ============================================================================

/// Lifecycle phase a plugin callback belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Init,
    Start,
    Destroy,
    HealthCheck,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Init => write!(f, "init"),
            LifecyclePhase::Start => write!(f, "start"),
            LifecyclePhase::Destroy => write!(f, "destroy"),
            LifecyclePhase::HealthCheck => write!(f, "health-check"),
        }
    }
}

/// Where a registered plugin currently sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Accepted by `use_plugin`, not yet initialised
    Registered,
    /// `init` completed
    Initialized,
    /// `start` completed
    Running,
    /// `start` failed and the kernel continued without rollback
    StartFailed,
    /// `destroy` has run for the current activation
    Destroyed,
}

impl PluginStatus {
    /// Whether `destroy` still has to run for this plugin.
    pub fn needs_destroy(self) -> bool {
        matches!(
            self,
            PluginStatus::Initialized | PluginStatus::Running | PluginStatus::StartFailed
        )
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Registered => write!(f, "registered"),
            PluginStatus::Initialized => write!(f, "initialized"),
            PluginStatus::Running => write!(f, "running"),
            PluginStatus::StartFailed => write!(f, "start-failed"),
            PluginStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Outcome of one plugin's `start` phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStartResult {
    pub plugin: String,
    pub success: bool,
    #[serde(with = "crate::utils::duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
}

/// Result of a single on-demand health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHealth {
    pub plugin: String,
    pub healthy: bool,
    pub message: Option<String>,
    #[serde(with = "crate::utils::duration_ms")]
    pub latency: Duration,
}

#[cfg(test)]
mod tests;
