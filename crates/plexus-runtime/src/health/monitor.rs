use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use plexus_kernel::Kernel;
use plexus_kernel::utils::{millis, now_ms};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{
    HealthCheckConfig, HealthError, HealthEvent, HealthReport, HealthStatus, HealthTarget,
    KernelHealthTarget,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct HealthState {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    restart_attempts: u32,
    total_checks: u64,
    total_failures: u64,
    last_error: Option<String>,
    last_checked_ms: Option<u64>,
}

impl HealthState {
    /// Apply one check result; returns the status before and after.
    fn record(
        &mut self,
        passed: bool,
        error: Option<String>,
        config: &HealthCheckConfig,
    ) -> (HealthStatus, HealthStatus) {
        let before = self.status;
        self.total_checks += 1;
        self.last_checked_ms = Some(now_ms());

        if passed {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_error = None;
            if self.consecutive_successes >= config.success_threshold {
                self.status = HealthStatus::Healthy;
                self.restart_attempts = 0;
            }
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_error = error;
            if self.consecutive_failures >= config.failure_threshold {
                self.status = HealthStatus::Unhealthy;
            } else if self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Degraded;
            }
        }

        (before, self.status)
    }

    fn report(&self, plugin: &str) -> HealthReport {
        HealthReport {
            plugin: plugin.to_string(),
            status: self.status,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            restart_attempts: self.restart_attempts,
            total_checks: self.total_checks,
            total_failures: self.total_failures,
            last_error: self.last_error.clone(),
            last_checked_ms: self.last_checked_ms,
        }
    }
}

struct Entry {
    plugin: String,
    config: HealthCheckConfig,
    target: Arc<dyn HealthTarget>,
    state: Mutex<HealthState>,
    /// Serialises rounds between the loop and `check_now`
    round: tokio::sync::Mutex<()>,
}

struct MonitorInner {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<HealthEvent>,
}

impl MonitorInner {
    fn emit(&self, event: HealthEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn status_changed(&self, plugin: &str, from: HealthStatus, to: HealthStatus) {
        if from == to {
            return;
        }
        match to {
            HealthStatus::Healthy => info!(plugin, %from, %to, "Plugin health changed"),
            HealthStatus::Degraded | HealthStatus::Unknown => {
                warn!(plugin, %from, %to, "Plugin health changed")
            }
            HealthStatus::Unhealthy | HealthStatus::Dead => {
                error!(plugin, %from, %to, "Plugin health changed")
            }
        }
        self.emit(HealthEvent::StatusChanged {
            plugin: plugin.to_string(),
            from,
            to,
        });
    }

    /// One check, plus restart handling when it leaves the plugin unhealthy.
    async fn round(&self, entry: &Entry) -> HealthStatus {
        let _guard = entry.round.lock().await;

        let current = entry.state.lock().status;
        if current == HealthStatus::Dead {
            return HealthStatus::Dead;
        }

        let outcome = tokio::time::timeout(entry.config.timeout, entry.target.check()).await;
        let (passed, failure) = match outcome {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => (false, Some("check reported unhealthy".to_string())),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_) => (
                false,
                Some(format!(
                    "check timed out after {}ms",
                    millis(entry.config.timeout)
                )),
            ),
        };
        if let Some(reason) = &failure {
            debug!(plugin = %entry.plugin, reason = %reason, "Health check failed");
        }

        let (before, after) = entry.state.lock().record(passed, failure, &entry.config);
        self.status_changed(&entry.plugin, before, after);

        if after == HealthStatus::Unhealthy && entry.config.auto_restart {
            return self.recover(entry).await;
        }
        after
    }

    /// Restart with backoff until a restart succeeds or attempts run out.
    async fn recover(&self, entry: &Entry) -> HealthStatus {
        loop {
            let attempts = entry.state.lock().restart_attempts;
            if attempts >= entry.config.max_restart_attempts {
                let before = {
                    let mut state = entry.state.lock();
                    std::mem::replace(&mut state.status, HealthStatus::Dead)
                };
                error!(plugin = %entry.plugin, attempts, "Restart attempts exhausted, plugin is dead");
                self.status_changed(&entry.plugin, before, HealthStatus::Dead);
                self.emit(HealthEvent::RestartExhausted {
                    plugin: entry.plugin.clone(),
                    attempts,
                });
                return HealthStatus::Dead;
            }

            let delay = entry.config.restart_delay(attempts);
            tokio::time::sleep(delay).await;

            let attempt = attempts + 1;
            entry.state.lock().restart_attempts = attempt;
            info!(plugin = %entry.plugin, attempt, delay_ms = millis(delay), "Restarting unhealthy plugin");
            self.emit(HealthEvent::RestartAttempted {
                plugin: entry.plugin.clone(),
                attempt,
                delay,
            });

            match entry.target.restart().await {
                Ok(()) => {
                    let before = {
                        let mut state = entry.state.lock();
                        state.consecutive_failures = 0;
                        state.consecutive_successes = 0;
                        std::mem::replace(&mut state.status, HealthStatus::Unknown)
                    };
                    self.emit(HealthEvent::Restarted {
                        plugin: entry.plugin.clone(),
                        attempt,
                    });
                    self.status_changed(&entry.plugin, before, HealthStatus::Unknown);
                    return HealthStatus::Unknown;
                }
                Err(err) => {
                    warn!(plugin = %entry.plugin, attempt, error = %err, "Restart attempt failed");
                }
            }
        }
    }
}

/// Supervises plugins with one periodic check loop each.
///
/// ```rust,ignore
/// let monitor = HealthMonitor::new();
/// monitor.register_plugin(&kernel, "db", HealthCheckConfig::default().with_auto_restart(3))?;
/// monitor.start();
/// let mut events = monitor.subscribe();
/// ```
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                entries: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Monitor an arbitrary target under `plugin`.
    pub fn register(
        &self,
        plugin: &str,
        target: Arc<dyn HealthTarget>,
        config: HealthCheckConfig,
    ) -> Result<(), HealthError> {
        let mut entries = self.inner.entries.write();
        if entries.contains_key(plugin) {
            return Err(HealthError::AlreadyRegistered(plugin.to_string()));
        }
        entries.insert(
            plugin.to_string(),
            Arc::new(Entry {
                plugin: plugin.to_string(),
                config,
                target,
                state: Mutex::new(HealthState::default()),
                round: tokio::sync::Mutex::new(()),
            }),
        );
        debug!(plugin, "Health monitoring registered");
        Ok(())
    }

    /// Monitor a plugin owned by `kernel`; restarts go through
    /// [`Kernel::restart_plugin`].
    pub fn register_plugin(
        &self,
        kernel: &Kernel,
        plugin: &str,
        config: HealthCheckConfig,
    ) -> Result<(), HealthError> {
        let target = Arc::new(KernelHealthTarget::new(kernel.clone(), plugin));
        self.register(plugin, target, config)
    }

    /// Stop monitoring `plugin`. Returns whether it was monitored.
    pub fn unregister(&self, plugin: &str) -> bool {
        if let Some(task) = self.inner.tasks.lock().remove(plugin) {
            task.abort();
        }
        self.inner.entries.write().remove(plugin).is_some()
    }

    /// Spawn the check loop of every registered plugin that is not
    /// already being checked.
    pub fn start(&self) {
        let entries: Vec<Arc<Entry>> = self.inner.entries.read().values().cloned().collect();
        let mut tasks = self.inner.tasks.lock();
        for entry in entries {
            if tasks.get(&entry.plugin).is_some_and(|t| !t.is_finished()) {
                continue;
            }
            let inner = self.inner.clone();
            let plugin = entry.plugin.clone();
            tasks.insert(plugin, tokio::spawn(run_loop(inner, entry)));
        }
        info!(loops = tasks.len(), "Health monitor started");
    }

    /// Abort every check loop. Statuses are kept.
    pub fn stop(&self) {
        let mut tasks = self.inner.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
        info!("Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.tasks.lock().values().any(|t| !t.is_finished())
    }

    /// Run one check round for `plugin` right now, including any restart it
    /// triggers.
    pub async fn check_now(&self, plugin: &str) -> Result<HealthStatus, HealthError> {
        let entry = self.entry(plugin)?;
        Ok(self.inner.round(&entry).await)
    }

    pub fn status(&self, plugin: &str) -> Option<HealthStatus> {
        self.inner
            .entries
            .read()
            .get(plugin)
            .map(|entry| entry.state.lock().status)
    }

    /// Status of every monitored plugin, dead ones included.
    pub fn get_all_health_statuses(&self) -> HashMap<String, HealthStatus> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(plugin, entry)| (plugin.clone(), entry.state.lock().status))
            .collect()
    }

    pub fn health_report(&self, plugin: &str) -> Option<HealthReport> {
        self.inner
            .entries
            .read()
            .get(plugin)
            .map(|entry| entry.state.lock().report(plugin))
    }

    /// Fails with [`HealthError::RestartExhausted`] once `plugin` is dead.
    pub fn ensure_alive(&self, plugin: &str) -> Result<(), HealthError> {
        let entry = self.entry(plugin)?;
        let state = entry.state.lock();
        if state.status == HealthStatus::Dead {
            return Err(HealthError::RestartExhausted {
                plugin: plugin.to_string(),
                attempts: state.restart_attempts,
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    fn entry(&self, plugin: &str) -> Result<Arc<Entry>, HealthError> {
        self.inner
            .entries
            .read()
            .get(plugin)
            .cloned()
            .ok_or_else(|| HealthError::NotRegistered(plugin.to_string()))
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(inner: Arc<MonitorInner>, entry: Arc<Entry>) {
    let mut ticker = tokio::time::interval(entry.config.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if inner.round(&entry).await == HealthStatus::Dead {
            debug!(plugin = %entry.plugin, "Health loop finished");
            break;
        }
    }
}
