//! Periodic health supervision of running plugins.
//!
//! Each monitored plugin gets its own check loop driven by its
//! [`HealthCheckConfig`]. Consecutive results move the plugin between
//! [`HealthStatus`] values; an unhealthy plugin may be restarted
//! automatically with [`BackoffStrategy`] spacing until
//! `max_restart_attempts` is used up, after which it is `Dead`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use plexus_kernel::utils::duration_ms;
use plexus_kernel::{Kernel, KernelResult, PluginError, PluginResult};
use serde::{Deserialize, Serialize};

mod backoff;
mod monitor;

pub use backoff::BackoffStrategy;
pub use monitor::HealthMonitor;

// ============================================================================
// Configuration
// ============================================================================

/// Per-plugin check and restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Time between two checks
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Deadline for a single check
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Consecutive failures before the plugin is unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes before the plugin is healthy
    pub success_threshold: u32,
    pub auto_restart: bool,
    /// Restarts attempted before the plugin is declared dead
    pub max_restart_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Delay before the first restart attempt
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Ceiling for any restart delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 1,
            auto_restart: false,
            max_restart_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl HealthCheckConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, failure: u32, success: u32) -> Self {
        self.failure_threshold = failure.max(1);
        self.success_threshold = success.max(1);
        self
    }

    pub fn with_auto_restart(mut self, max_attempts: u32) -> Self {
        self.auto_restart = true;
        self.max_restart_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        self.backoff = strategy;
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Delay before restart attempt `attempt` (0-indexed).
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        self.backoff
            .delay_for(attempt, self.base_delay, self.max_delay)
    }
}

// ============================================================================
// Status & reporting
// ============================================================================

/// Derived health of a monitored plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not enough results yet
    #[default]
    Unknown,
    Healthy,
    /// Failing, but below the failure threshold
    Degraded,
    Unhealthy,
    /// Restart attempts exhausted; never retried automatically
    Dead,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Counters behind a plugin's current status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub plugin: String,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    /// Milliseconds since the UNIX epoch
    pub last_checked_ms: Option<u64>,
}

/// Notifications published by [`HealthMonitor::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    StatusChanged {
        plugin: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    RestartAttempted {
        plugin: String,
        attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    Restarted {
        plugin: String,
        attempt: u32,
    },
    RestartExhausted {
        plugin: String,
        attempts: u32,
    },
}

/// Health monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HealthError {
    #[error("plugin '{0}' is not monitored")]
    NotRegistered(String),

    #[error("plugin '{0}' is already monitored")]
    AlreadyRegistered(String),

    /// The plugin stayed unhealthy through every allowed restart.
    #[error("plugin '{plugin}' is dead after {attempts} restart attempts")]
    RestartExhausted { plugin: String, attempts: u32 },
}

// ============================================================================
// Targets
// ============================================================================

/// Something the monitor can probe and restart.
#[async_trait]
pub trait HealthTarget: Send + Sync {
    /// `Ok(false)` and `Err(_)` both count as a failed check.
    async fn check(&self) -> PluginResult<bool>;

    async fn restart(&self) -> KernelResult<()>;
}

/// Binds a monitor entry to a plugin owned by a [`Kernel`].
#[derive(Debug, Clone)]
pub struct KernelHealthTarget {
    kernel: Kernel,
    plugin: String,
}

impl KernelHealthTarget {
    pub fn new(kernel: Kernel, plugin: &str) -> Self {
        Self {
            kernel,
            plugin: plugin.to_string(),
        }
    }
}

#[async_trait]
impl HealthTarget for KernelHealthTarget {
    async fn check(&self) -> PluginResult<bool> {
        let health = self
            .kernel
            .check_plugin_health(&self.plugin)
            .await
            .map_err(|e| PluginError::HealthCheckFailed(e.to_string()))?;
        match health.message {
            Some(message) if !health.healthy => Err(PluginError::Other(message)),
            _ => Ok(health.healthy),
        }
    }

    async fn restart(&self) -> KernelResult<()> {
        self.kernel.restart_plugin(&self.plugin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_delay() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.success_threshold, 1);
        assert!(!config.auto_restart);
        assert_eq!(config.restart_delay(0), Duration::from_secs(1));
        assert_eq!(config.restart_delay(2), Duration::from_secs(4));
        assert_eq!(config.restart_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: HealthCheckConfig = serde_json::from_str(
            r#"{ "interval": 500, "backoff": "linear", "auto_restart": true }"#,
        )
        .unwrap();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert!(config.auto_restart);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn event_serializes_tagged() {
        let event = HealthEvent::StatusChanged {
            plugin: "db".into(),
            from: HealthStatus::Healthy,
            to: HealthStatus::Degraded,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "degraded");
    }
}
