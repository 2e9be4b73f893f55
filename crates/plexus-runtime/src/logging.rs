//! Global `tracing` subscriber setup.

use plexus_kernel::{LogFormat, LoggerConfig};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` wins over the configured level, an invalid
/// configured level falls back to `info`.
pub fn env_filter(config: &LoggerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the process-wide subscriber.
///
/// Returns `false` when a global subscriber was already set; the existing one
/// stays in place.
pub fn init_logging(config: &LoggerConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}
