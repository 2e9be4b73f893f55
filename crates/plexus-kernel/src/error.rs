//! Crate-level error types for `plexus-kernel`.
//!
//! [`KernelError`] is the taxonomy every public kernel operation reports:
//! registration problems, dependency resolution failures, lifecycle
//! timeouts and callback failures, system validation, and service lookup.
//! Errors raised by plugins themselves travel as [`PluginError`] and are
//! wrapped, never rewritten, so callers can still match on them.

use std::time::Duration;

use thiserror::Error;

use crate::dependency::DependencyError;
use crate::kernel::KernelState;
use crate::plugin::{LifecyclePhase, PluginError};

/// Rejected registration of a plugin or service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistrationError {
    #[error("plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    /// `use_plugin` is only legal while the kernel is idle.
    #[error("cannot register plugin '{plugin}' while kernel is {state}")]
    Closed { plugin: String, state: KernelState },
}

/// Crate-level error type for `plexus-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// A lifecycle phase exceeded its deadline.
    #[error("plugin '{plugin}' timed out during {phase} after {}ms", .timeout.as_millis())]
    Timeout {
        plugin: String,
        phase: LifecyclePhase,
        timeout: Duration,
    },

    /// A plugin callback returned an error.
    #[error("plugin '{plugin}' failed during {phase}: {source}")]
    Lifecycle {
        plugin: String,
        phase: LifecyclePhase,
        #[source]
        source: PluginError,
    },

    /// A required system service is missing at final validation.
    #[error("required system service '{0}' is not registered")]
    Validation(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("service '{name}' is not of type {expected}")]
    ServiceTypeMismatch { name: String, expected: &'static str },

    /// The service (or one of its dependencies) is produced by an async
    /// factory and cannot be resolved through the synchronous getter.
    #[error("service '{0}' requires async resolution")]
    AsyncServiceRequired(String),

    #[error("scoped service '{0}' requires a scope id")]
    ScopeRequired(String),

    #[error("plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("cannot {operation} while kernel is {state}")]
    InvalidState {
        operation: &'static str,
        state: KernelState,
    },

    #[error("plugin '{plugin}' cannot {operation} while {status}")]
    InvalidPluginState {
        plugin: String,
        operation: &'static str,
        status: crate::plugin::PluginStatus,
    },

    /// Shutdown did not finish within its deadline; the kernel is stopped
    /// regardless.
    #[error("shutdown exceeded {}ms", .0.as_millis())]
    ShutdownTimeout(Duration),

    /// A hook handler failed while the event was being triggered.
    #[error("hook '{event}' failed: {source}")]
    Hook {
        event: String,
        #[source]
        source: PluginError,
    },

    /// The kernel a context was bound to has been dropped.
    #[error("kernel is no longer available")]
    KernelDropped,

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// A configuration-related error (requires the `config` feature).
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl KernelError {
    /// Name of the plugin this error is about, when there is one.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            KernelError::Timeout { plugin, .. }
            | KernelError::Lifecycle { plugin, .. }
            | KernelError::InvalidPluginState { plugin, .. } => Some(plugin),
            KernelError::PluginNotFound(plugin) => Some(plugin),
            KernelError::Dependency(e) => Some(e.plugin()),
            KernelError::Registration(RegistrationError::DuplicatePlugin(plugin))
            | KernelError::Registration(RegistrationError::Closed { plugin, .. }) => Some(plugin),
            _ => None,
        }
    }

    /// Lifecycle phase this error is about, when there is one.
    pub fn phase(&self) -> Option<LifecyclePhase> {
        match self {
            KernelError::Timeout { phase, .. } | KernelError::Lifecycle { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, KernelError::Timeout { .. } | KernelError::ShutdownTimeout(_))
    }
}

/// Convenience result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_plugin_and_phase() {
        let err = KernelError::Timeout {
            plugin: "Y".to_string(),
            phase: LifecyclePhase::Init,
            timeout: Duration::from_millis(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("'Y'"));
        assert!(msg.contains("init"));
        assert!(msg.contains("100ms"));
        assert!(err.is_timeout());
        assert_eq!(err.plugin(), Some("Y"));
        assert_eq!(err.phase(), Some(LifecyclePhase::Init));
    }

    #[test]
    fn lifecycle_error_keeps_plugin_source() {
        let err = KernelError::Lifecycle {
            plugin: "X".to_string(),
            phase: LifecyclePhase::Start,
            source: PluginError::StartFailed("port in use".to_string()),
        };
        assert!(err.to_string().contains("port in use"));
        assert!(!err.is_timeout());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("port in use"));
    }

    #[test]
    fn registration_error_converts_via_from() {
        let err: KernelError = RegistrationError::DuplicateService("cache".to_string()).into();
        assert!(matches!(
            err,
            KernelError::Registration(RegistrationError::DuplicateService(_))
        ));
        assert!(err.to_string().contains("cache"));
    }

    #[test]
    fn plugin_error_converts_via_from() {
        let err: KernelError = PluginError::other("boom").into();
        assert!(matches!(err, KernelError::Plugin(_)));
        assert_eq!(err.plugin(), None);
    }
}
