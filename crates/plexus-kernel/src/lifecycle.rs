//! Deadline-bounded execution of plugin lifecycle callbacks.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::PluginContext;
use crate::error::{KernelError, KernelResult};
use crate::plugin::{LifecyclePhase, Plugin, PluginResult};

/// Drives a single plugin through `init`, `start` and `destroy`.
///
/// Every phase is bounded by the plugin's own `startup_timeout`, falling
/// back to the kernel-wide default. A phase that misses its deadline is
/// reported as [`KernelError::Timeout`] and its future is dropped.
#[derive(Debug, Clone)]
pub struct LifecycleRunner {
    default_timeout: Duration,
}

impl LifecycleRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Deadline applied to every phase of `plugin`.
    pub fn deadline_for(&self, plugin: &dyn Plugin) -> Duration {
        plugin
            .metadata()
            .startup_timeout
            .unwrap_or(self.default_timeout)
    }

    pub async fn init(&self, plugin: &dyn Plugin, ctx: &PluginContext) -> KernelResult<Duration> {
        let deadline = self.deadline_for(plugin);
        self.run_phase(plugin.name(), LifecyclePhase::Init, deadline, plugin.init(ctx))
            .await
    }

    pub async fn start(&self, plugin: &dyn Plugin, ctx: &PluginContext) -> KernelResult<Duration> {
        let deadline = self.deadline_for(plugin);
        self.run_phase(plugin.name(), LifecyclePhase::Start, deadline, plugin.start(ctx))
            .await
    }

    pub async fn destroy(&self, plugin: &dyn Plugin) -> KernelResult<Duration> {
        let deadline = self.deadline_for(plugin);
        self.run_phase(plugin.name(), LifecyclePhase::Destroy, deadline, plugin.destroy())
            .await
    }

    /// Destroy with an explicit deadline instead of the plugin's own.
    pub async fn destroy_within(
        &self,
        plugin: &dyn Plugin,
        deadline: Duration,
    ) -> KernelResult<Duration> {
        self.run_phase(plugin.name(), LifecyclePhase::Destroy, deadline, plugin.destroy())
            .await
    }

    /// Run `fut` against `deadline`, returning the elapsed time on success.
    pub async fn run_phase<F>(
        &self,
        plugin: &str,
        phase: LifecyclePhase,
        deadline: Duration,
        fut: F,
    ) -> KernelResult<Duration>
    where
        F: Future<Output = PluginResult<()>>,
    {
        let started = Instant::now();
        debug!(plugin, %phase, timeout_ms = deadline.as_millis() as u64, "Running lifecycle phase");

        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                debug!(plugin, %phase, elapsed_ms = elapsed.as_millis() as u64, "Lifecycle phase completed");
                Ok(elapsed)
            }
            Ok(Err(source)) => Err(KernelError::Lifecycle {
                plugin: plugin.to_string(),
                phase,
                source,
            }),
            Err(_) => {
                warn!(plugin, %phase, timeout_ms = deadline.as_millis() as u64, "Lifecycle phase timed out");
                Err(KernelError::Timeout {
                    plugin: plugin.to_string(),
                    phase,
                    timeout: deadline,
                })
            }
        }
    }
}

impl Default for LifecycleRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginError;

    #[tokio::test(start_paused = true)]
    async fn phase_times_out_at_deadline() {
        let runner = LifecycleRunner::default();
        let begin = tokio::time::Instant::now();
        let err = runner
            .run_phase(
                "slow",
                LifecyclePhase::Init,
                Duration::from_millis(100),
                async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.plugin(), Some("slow"));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn callback_error_is_wrapped_with_phase() {
        let runner = LifecycleRunner::default();
        let err = runner
            .run_phase(
                "x",
                LifecyclePhase::Start,
                Duration::from_secs(1),
                async { Err(PluginError::StartFailed("boom".into())) },
            )
            .await
            .unwrap_err();

        match err {
            KernelError::Lifecycle { plugin, phase, source } => {
                assert_eq!(plugin, "x");
                assert_eq!(phase, LifecyclePhase::Start);
                assert!(matches!(source, PluginError::StartFailed(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
