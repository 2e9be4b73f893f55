//! Typed errors raised by plugin callbacks.

use thiserror::Error;

/// Errors a plugin reports from its own lifecycle callbacks, hook handlers
/// and health checks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// Plugin failed during `init`.
    #[error("Plugin initialization failed: {0}")]
    InitFailed(String),

    /// Plugin failed during `start`.
    #[error("Plugin start failed: {0}")]
    StartFailed(String),

    /// Plugin failed during `destroy`.
    #[error("Plugin destroy failed: {0}")]
    DestroyFailed(String),

    /// The plugin's own health probe failed.
    #[error("Plugin health check failed: {0}")]
    HealthCheckFailed(String),

    /// Capturing or restoring in-memory state failed.
    #[error("Plugin state error: {0}")]
    State(String),

    /// An I/O error surfaced during a plugin operation.
    #[error("Plugin I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A (de)serialization error surfaced during a plugin operation.
    #[error("Plugin serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

impl PluginError {
    /// Convenience constructor for ad-hoc failures.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
