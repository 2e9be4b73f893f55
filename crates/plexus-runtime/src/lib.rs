// =============================================================================
// Plexus Runtime - Supervision around the plugin kernel
// =============================================================================
//
// The kernel owns plugin lifecycles; this crate watches them while the
// process runs.
//
// Main Components:
// - HealthMonitor: periodic checks, status thresholds and restart backoff
// - signal: Ctrl-C / SIGTERM driven graceful shutdown
// - logging: tracing subscriber setup from LoggerConfig
//
// =============================================================================

pub mod health;
pub mod logging;
pub mod signal;

pub use health::{
    BackoffStrategy, HealthCheckConfig, HealthError, HealthEvent, HealthMonitor, HealthReport,
    HealthStatus, HealthTarget, KernelHealthTarget,
};
pub use logging::init_logging;
pub use signal::{ExitHook, install as install_signal_handler, shutdown_on_signal};

// Kernel types most runtime users need alongside the monitor
pub use plexus_kernel::{Kernel, KernelConfig, KernelError, KernelResult, Plugin, PluginContext};
