//! Health monitor behaviour against scripted targets and a live kernel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use plexus_kernel::{
    Kernel, KernelConfig, KernelError, KernelResult, Plugin, PluginContext, PluginError,
    PluginMetadata, PluginResult, PluginStatus,
};
use plexus_runtime::{
    BackoffStrategy, HealthCheckConfig, HealthError, HealthEvent, HealthMonitor, HealthStatus,
    HealthTarget,
};

/// Target whose check result and restart outcome are set by the test.
#[derive(Default)]
struct ScriptedTarget {
    healthy: AtomicBool,
    restart_succeeds: AtomicBool,
    /// A successful restart also makes the target healthy again
    heal_on_restart: AtomicBool,
    check_delay_ms: AtomicU32,
    checks: AtomicU32,
    restarts: AtomicU32,
}

#[async_trait]
impl HealthTarget for ScriptedTarget {
    async fn check(&self) -> PluginResult<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let delay = self.check_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn restart(&self) -> KernelResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if !self.restart_succeeds.load(Ordering::SeqCst) {
            return Err(KernelError::Plugin(PluginError::other("restart refused")));
        }
        if self.heal_on_restart.load(Ordering::SeqCst) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<HealthEvent>) -> Vec<HealthEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_restarts_exhausted_marks_plugin_dead() {
    let monitor = HealthMonitor::new();
    let target = Arc::new(ScriptedTarget::default());
    let config = HealthCheckConfig::default()
        .with_thresholds(2, 1)
        .with_auto_restart(2)
        .with_backoff(
            BackoffStrategy::Fixed,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
    monitor.register("db", target.clone(), config).unwrap();
    let mut events = monitor.subscribe();

    assert_eq!(monitor.check_now("db").await.unwrap(), HealthStatus::Unknown);
    assert_eq!(monitor.check_now("db").await.unwrap(), HealthStatus::Dead);
    assert_eq!(target.restarts.load(Ordering::SeqCst), 2);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            HealthEvent::StatusChanged {
                plugin: "db".into(),
                from: HealthStatus::Unknown,
                to: HealthStatus::Unhealthy,
            },
            HealthEvent::RestartAttempted {
                plugin: "db".into(),
                attempt: 1,
                delay: Duration::from_millis(100),
            },
            HealthEvent::RestartAttempted {
                plugin: "db".into(),
                attempt: 2,
                delay: Duration::from_millis(100),
            },
            HealthEvent::StatusChanged {
                plugin: "db".into(),
                from: HealthStatus::Unhealthy,
                to: HealthStatus::Dead,
            },
            HealthEvent::RestartExhausted {
                plugin: "db".into(),
                attempts: 2,
            },
        ]
    );

    assert_eq!(
        monitor.ensure_alive("db"),
        Err(HealthError::RestartExhausted {
            plugin: "db".into(),
            attempts: 2,
        })
    );

    // dead plugins are not checked again
    let checks = target.checks.load(Ordering::SeqCst);
    assert_eq!(monitor.check_now("db").await.unwrap(), HealthStatus::Dead);
    assert_eq!(target.checks.load(Ordering::SeqCst), checks);
    assert_eq!(
        monitor.get_all_health_statuses().get("db"),
        Some(&HealthStatus::Dead)
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_restart_resets_attempts() {
    let monitor = HealthMonitor::new();
    let target = Arc::new(ScriptedTarget::default());
    target.restart_succeeds.store(true, Ordering::SeqCst);
    target.heal_on_restart.store(true, Ordering::SeqCst);
    let config = HealthCheckConfig::default()
        .with_thresholds(1, 1)
        .with_auto_restart(3);
    monitor.register("cache", target.clone(), config).unwrap();

    assert_eq!(
        monitor.check_now("cache").await.unwrap(),
        HealthStatus::Unknown
    );
    assert_eq!(monitor.health_report("cache").unwrap().restart_attempts, 1);

    assert_eq!(
        monitor.check_now("cache").await.unwrap(),
        HealthStatus::Healthy
    );
    let report = monitor.health_report("cache").unwrap();
    assert_eq!(report.restart_attempts, 0);
    assert_eq!(report.total_checks, 2);
    assert_eq!(report.total_failures, 1);
    assert!(monitor.ensure_alive("cache").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_check_timeout_counts_as_failure() {
    let monitor = HealthMonitor::new();
    let target = Arc::new(ScriptedTarget::default());
    target.healthy.store(true, Ordering::SeqCst);
    target.check_delay_ms.store(10_000, Ordering::SeqCst);
    let config = HealthCheckConfig::default()
        .with_thresholds(1, 1)
        .with_timeout(Duration::from_millis(100));
    monitor.register("slow", target, config).unwrap();

    assert_eq!(
        monitor.check_now("slow").await.unwrap(),
        HealthStatus::Unhealthy
    );
    let report = monitor.health_report("slow").unwrap();
    assert!(report.last_error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_loop_reaches_unhealthy() {
    let monitor = HealthMonitor::new();
    let target = Arc::new(ScriptedTarget::default());
    let config = HealthCheckConfig::default()
        .with_interval(Duration::from_secs(1))
        .with_thresholds(3, 1);
    monitor.register("queue", target.clone(), config).unwrap();

    monitor.start();
    assert!(monitor.is_running());
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(monitor.status("queue"), Some(HealthStatus::Unhealthy));
    assert!(target.checks.load(Ordering::SeqCst) >= 3);
    // no auto restart configured
    assert_eq!(target.restarts.load(Ordering::SeqCst), 0);

    monitor.stop();
    assert!(!monitor.is_running());
    let checks = target.checks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(target.checks.load(Ordering::SeqCst), checks);
}

#[tokio::test]
async fn test_registration_errors() {
    let monitor = HealthMonitor::new();
    let target = Arc::new(ScriptedTarget::default());
    monitor
        .register("db", target.clone(), HealthCheckConfig::default())
        .unwrap();

    assert_eq!(
        monitor.register("db", target, HealthCheckConfig::default()),
        Err(HealthError::AlreadyRegistered("db".into()))
    );
    assert_eq!(
        monitor.check_now("ghost").await,
        Err(HealthError::NotRegistered("ghost".into()))
    );
    assert!(monitor.unregister("db"));
    assert!(!monitor.unregister("db"));
    assert_eq!(monitor.status("db"), None);
}

/// Plugin that turns unhealthy on demand and recovers on re-init.
struct FlakyPlugin {
    metadata: PluginMetadata,
    healthy: Arc<AtomicBool>,
    inits: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for FlakyPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn init(&self, _ctx: &PluginContext) -> PluginResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> PluginResult<bool> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(PluginError::HealthCheckFailed("connection lost".into()))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_kernel_plugin_is_restarted() {
    let healthy = Arc::new(AtomicBool::new(false));
    let inits = Arc::new(AtomicU32::new(0));
    let kernel = Kernel::new(KernelConfig::default().with_skip_system_validation(true));
    kernel
        .use_plugin(FlakyPlugin {
            metadata: PluginMetadata::new("db"),
            healthy: healthy.clone(),
            inits: inits.clone(),
        })
        .unwrap();
    kernel.bootstrap().await.unwrap();

    let monitor = HealthMonitor::new();
    monitor
        .register_plugin(
            &kernel,
            "db",
            HealthCheckConfig::default()
                .with_thresholds(1, 1)
                .with_auto_restart(1),
        )
        .unwrap();

    assert!(monitor.check_now("db").await.is_ok());
    assert_eq!(monitor.status("db"), Some(HealthStatus::Healthy));

    healthy.store(false, Ordering::SeqCst);
    assert_eq!(monitor.check_now("db").await.unwrap(), HealthStatus::Unknown);
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(kernel.plugin_status("db"), Some(PluginStatus::Running));
    assert_eq!(
        monitor.health_report("db").unwrap().last_error.as_deref(),
        Some("Plugin health check failed: connection lost")
    );

    assert_eq!(monitor.check_now("db").await.unwrap(), HealthStatus::Healthy);
}
