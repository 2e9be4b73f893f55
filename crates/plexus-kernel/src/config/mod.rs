//! Kernel configuration
//!
//! [`KernelConfig`] is plain serde data with defaults for every field, so a
//! partial file only overrides what it names. With the `config` feature
//! (on by default) it can be loaded from YAML, TOML, JSON, INI, RON or
//! JSON5, with `${VAR}` / `$VAR` environment substitution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::duration_ms;

#[cfg(feature = "config")]
mod loader;
#[cfg(feature = "config")]
pub use loader::*;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging options consumed by the runtime's subscriber setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `EnvFilter` directive, e.g. `info` or `plexus_kernel=debug,info`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Kernel-wide options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub logger: LoggerConfig,
    /// Deadline for each lifecycle phase of plugins without their own
    #[serde(with = "duration_ms")]
    pub default_startup_timeout: Duration,
    /// Whether process signals should drive a graceful shutdown
    pub graceful_shutdown: bool,
    /// Upper bound for the whole of `shutdown()`
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Destroy already started plugins when a later one fails to start
    pub rollback_on_failure: bool,
    /// Skip the system service check at the end of bootstrap
    pub skip_system_validation: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            default_startup_timeout: Duration::from_secs(30),
            graceful_shutdown: true,
            shutdown_timeout: Duration::from_secs(60),
            rollback_on_failure: true,
            skip_system_validation: false,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: LoggerConfig) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_default_startup_timeout(mut self, timeout: Duration) -> Self {
        self.default_startup_timeout = timeout;
        self
    }

    pub fn with_graceful_shutdown(mut self, enabled: bool) -> Self {
        self.graceful_shutdown = enabled;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    pub fn with_skip_system_validation(mut self, skip: bool) -> Self {
        self.skip_system_validation = skip;
        self
    }

    /// Load from a file, picking the format from its extension.
    #[cfg(feature = "config")]
    pub fn from_file(path: &str) -> ConfigResult<Self> {
        load_config(path)
    }

    /// [`KernelConfig::from_file`] with `PLEXUS_*` environment overrides,
    /// e.g. `PLEXUS_SHUTDOWN_TIMEOUT=5000` or `PLEXUS_LOGGER__LEVEL=debug`.
    #[cfg(feature = "config")]
    pub fn from_file_with_env(path: &str) -> ConfigResult<Self> {
        load_with_env(path, ENV_PREFIX)
    }
}

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "PLEXUS";
