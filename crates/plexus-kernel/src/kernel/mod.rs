//! The kernel: plugin set, global state machine and bootstrap/shutdown
//! orchestration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::KernelConfig;
use crate::context::PluginContext;
use crate::dependency::DependencyResolver;
use crate::error::{KernelError, KernelResult, RegistrationError};
use crate::hooks::{HookHandler, HookTable, KERNEL_READY, KERNEL_SHUTDOWN, PLUGIN_DESTROYED, PLUGIN_STARTED};
use crate::lifecycle::LifecycleRunner;
use crate::plugin::{
    LifecyclePhase, Plugin, PluginError, PluginHealth, PluginResult, PluginStartResult, PluginStatus,
};
use crate::service::{AnyService, ServiceFactory, ServiceLifecycle, ServiceRegistry};

pub mod state;
pub mod validation;

pub use state::KernelState;
pub use validation::{
    SYSTEM_SERVICE_REQUIREMENTS, ServiceCriticality, ValidationReport, criticality,
    validate_system_services,
};

/// A caller-registered shutdown step.
pub type ShutdownHandler = Arc<dyn Fn() -> BoxFuture<'static, PluginResult<()>> + Send + Sync>;

struct PluginSlot {
    name: String,
    plugin: Arc<dyn Plugin>,
    status: PluginStatus,
    /// An activation is in flight
    busy: bool,
}

#[doc(hidden)]
pub struct KernelInner {
    config: KernelConfig,
    state: RwLock<KernelState>,
    /// Registration order
    plugins: RwLock<Vec<PluginSlot>>,
    services: ServiceRegistry,
    hooks: HookTable,
    shutdown_handlers: Mutex<Vec<ShutdownHandler>>,
    runner: LifecycleRunner,
    /// Latest start outcome per plugin, in first-start order
    start_results: RwLock<Vec<PluginStartResult>>,
    /// Plugins currently started, in the order their `start` succeeded
    start_order: RwLock<Vec<String>>,
    /// Signalled once bootstrap stops touching plugins
    bootstrap_done: Notify,
}

/// Signals `bootstrap_done` however bootstrap ends, including when its
/// future is dropped.
struct BootstrapGuard<'a>(&'a Notify);

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

/// Plugin microkernel.
///
/// Cheap to clone; all clones drive the same kernel. Plugins reach the
/// kernel through their [`PluginContext`], which holds a weak reference.
///
/// ```rust,ignore
/// let kernel = Kernel::new(KernelConfig::default());
/// kernel.use_plugin(DbPlugin::new())?;
/// kernel.use_plugin(ApiPlugin::new())?;
/// kernel.bootstrap().await?;
/// // ...
/// kernel.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let runner = LifecycleRunner::new(config.default_startup_timeout);
        Self {
            inner: Arc::new(KernelInner {
                config,
                state: RwLock::new(KernelState::Idle),
                plugins: RwLock::new(Vec::new()),
                services: ServiceRegistry::new(),
                hooks: HookTable::new(),
                shutdown_handlers: Mutex::new(Vec::new()),
                runner,
                start_results: RwLock::new(Vec::new()),
                start_order: RwLock::new(Vec::new()),
                bootstrap_done: Notify::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<KernelInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<KernelInner> {
        &self.inner
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> KernelState {
        *self.inner.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == KernelState::Running
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn runner(&self) -> &LifecycleRunner {
        &self.inner.runner
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a plugin. Only legal while the kernel is idle.
    pub fn use_plugin<P: Plugin + 'static>(&self, plugin: P) -> KernelResult<()> {
        self.use_shared_plugin(Arc::new(plugin))
    }

    pub fn use_shared_plugin(&self, plugin: Arc<dyn Plugin>) -> KernelResult<()> {
        let name = plugin.name().to_string();
        let state = self.inner.state.read();
        if *state != KernelState::Idle {
            return Err(RegistrationError::Closed {
                plugin: name,
                state: *state,
            }
            .into());
        }

        let mut plugins = self.inner.plugins.write();
        if plugins.iter().any(|slot| slot.name == name) {
            return Err(RegistrationError::DuplicatePlugin(name).into());
        }
        debug!(plugin = %name, version = %plugin.metadata().version, "Plugin registered");
        plugins.push(PluginSlot {
            name,
            plugin,
            status: PluginStatus::Registered,
            busy: false,
        });
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner
            .plugins
            .read()
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.plugin.clone())
    }

    /// Registered plugin names, in registration order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.inner
            .plugins
            .read()
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }

    pub fn plugin_status(&self, name: &str) -> Option<PluginStatus> {
        self.inner
            .plugins
            .read()
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.status)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    pub fn register_service<T: Any + Send + Sync>(&self, name: &str, instance: T) -> KernelResult<()> {
        self.inner.services.register(name, Arc::new(instance))
    }

    pub fn register_shared_service(&self, name: &str, instance: AnyService) -> KernelResult<()> {
        self.inner.services.register(name, instance)
    }

    pub fn register_service_factory(
        &self,
        name: &str,
        factory: ServiceFactory,
        lifecycle: ServiceLifecycle,
        dependencies: Vec<String>,
    ) -> KernelResult<()> {
        self.inner
            .services
            .register_factory(name, factory, lifecycle, dependencies)
    }

    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> KernelResult<Arc<T>> {
        self.inner.services.get(name)
    }

    pub async fn get_service_async<T: Any + Send + Sync>(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> KernelResult<Arc<T>> {
        self.inner.services.get_async(name, scope).await
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn hook(&self, event: &str, handler: HookHandler) {
        self.inner.hooks.register(event, handler);
    }

    /// Run every handler registered for `event` in registration order.
    pub async fn trigger(&self, event: &str, args: Vec<Value>) -> KernelResult<()> {
        self.inner
            .hooks
            .trigger(event, args)
            .await
            .map_err(|source| KernelError::Hook {
                event: event.to_string(),
                source,
            })
    }

    /// Trigger for kernel-originated events; handler failures are logged.
    async fn fire(&self, event: &str, args: Vec<Value>) {
        if let Err(err) = self.trigger(event, args).await {
            warn!(event, error = %err, "Hook handler failed");
        }
    }

    /// Register a step to run at the end of `shutdown()`, after every plugin
    /// was destroyed.
    pub fn on_shutdown<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PluginResult<()>> + Send + 'static,
    {
        let handler: ShutdownHandler = Arc::new(move || Box::pin(handler()));
        self.inner.shutdown_handlers.lock().push(handler);
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Resolve, initialise and start every registered plugin.
    ///
    /// Any failure leaves the kernel `Stopped` and is returned unchanged, so
    /// the error still names the plugin and phase that failed. A shutdown
    /// begun meanwhile stops it after the current plugin with
    /// [`KernelError::InvalidState`].
    pub async fn bootstrap(&self) -> KernelResult<()> {
        self.transition(KernelState::Idle, KernelState::Initializing, "bootstrap")?;
        let _done = BootstrapGuard(&self.inner.bootstrap_done);
        info!(plugins = self.inner.plugins.read().len(), "Bootstrapping kernel");

        match self.run_bootstrap().await {
            Ok(()) => {
                let mut state = self.inner.state.write();
                if *state != KernelState::Initializing {
                    return Err(KernelError::InvalidState {
                        operation: "finish bootstrap",
                        state: *state,
                    });
                }
                *state = KernelState::Running;
                info!("Kernel running");
                Ok(())
            }
            Err(err) => {
                // a concurrent shutdown owns the final transition
                let mut state = self.inner.state.write();
                if *state == KernelState::Initializing {
                    *state = KernelState::Stopped;
                }
                drop(state);
                error!(error = %err, "Kernel bootstrap failed");
                Err(err)
            }
        }
    }

    async fn run_bootstrap(&self) -> KernelResult<()> {
        let order = {
            let plugins = self.inner.plugins.read();
            DependencyResolver::resolve(plugins.iter().map(|slot| {
                (
                    slot.name.clone(),
                    slot.plugin.metadata().dependencies.clone(),
                )
            }))?
        };
        debug!(?order, "Resolved plugin order");

        // init failures are not rolled back: nothing has started yet
        for name in &order {
            let plugin = self.slot_plugin(name)?;
            let ctx = PluginContext::new(name, self);
            self.inner.runner.init(plugin.as_ref(), &ctx).await?;
            self.set_status(name, PluginStatus::Initialized);
            self.ensure_bootstrapping()?;
        }

        for name in &order {
            let plugin = self.slot_plugin(name)?;
            let ctx = PluginContext::new(name, self);
            if let Err(err) = self.start_one(name, plugin.as_ref(), &ctx).await {
                if self.inner.config.rollback_on_failure {
                    error!(plugin = %name, error = %err, "Plugin failed to start, rolling back");
                    self.rollback().await;
                    return Err(err);
                }
                warn!(plugin = %name, error = %err, "Plugin failed to start, continuing degraded");
            }
            self.ensure_bootstrapping()?;
        }

        if !self.inner.config.skip_system_validation {
            let report = validate_system_services(&self.inner.services);
            for service in &report.missing_core {
                warn!(service = %service, "Core system service missing, running degraded");
            }
            if let Some(service) = report.missing_required.first() {
                error!(service = %service, "Required system service missing");
                if self.inner.config.rollback_on_failure {
                    self.rollback().await;
                }
                return Err(KernelError::Validation(service.clone()));
            }
        }

        self.fire(KERNEL_READY, Vec::new()).await;
        Ok(())
    }

    /// Stop bootstrapping once a shutdown has begun; the shutdown tears down
    /// whatever was initialised or started so far.
    fn ensure_bootstrapping(&self) -> KernelResult<()> {
        let state = self.state();
        if state != KernelState::Initializing {
            warn!(state = %state, "Shutdown requested during bootstrap");
            return Err(KernelError::InvalidState {
                operation: "bootstrap",
                state,
            });
        }
        Ok(())
    }

    /// Start one initialised plugin, recording the outcome.
    async fn start_one(&self, name: &str, plugin: &dyn Plugin, ctx: &PluginContext) -> KernelResult<()> {
        let began = Instant::now();
        match self.inner.runner.start(plugin, ctx).await {
            Ok(duration) => {
                self.record_start(name, true, duration, None);
                self.set_status(name, PluginStatus::Running);
                self.inner.start_order.write().push(name.to_string());
                info!(plugin = %name, elapsed_ms = crate::utils::millis(duration), "Plugin started");
                self.fire(PLUGIN_STARTED, vec![Value::from(name)]).await;
                Ok(())
            }
            Err(err) => {
                self.record_start(name, false, began.elapsed(), Some(err.to_string()));
                self.set_status(name, PluginStatus::StartFailed);
                Err(err)
            }
        }
    }

    /// Destroy every started plugin in reverse start order. Errors are
    /// logged and do not stop the remaining destroys.
    async fn rollback(&self) {
        let started: Vec<String> = self.inner.start_order.read().iter().rev().cloned().collect();
        for name in started {
            if let Err(err) = self.destroy_slot(&name, None).await {
                error!(plugin = %name, error = %err, "Destroy failed during rollback");
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Tear the kernel down. Calls made while already stopping or stopped
    /// are no-ops. During bootstrap, teardown waits for the lifecycle call
    /// in flight to return; bootstrap then stops and fails.
    ///
    /// The kernel always ends `Stopped`; exceeding `shutdown_timeout`
    /// additionally returns [`KernelError::ShutdownTimeout`].
    pub async fn shutdown(&self) -> KernelResult<()> {
        let previous = {
            let mut state = self.inner.state.write();
            if state.is_terminal() {
                debug!(state = %*state, "Shutdown already in progress or done");
                return Ok(());
            }
            std::mem::replace(&mut *state, KernelState::Stopping)
        };
        info!(from = %previous, "Shutting down kernel");

        let deadline = self.inner.config.shutdown_timeout;
        let stop = async {
            if previous == KernelState::Initializing {
                // let bootstrap finish its in-flight step first
                self.inner.bootstrap_done.notified().await;
            }
            self.teardown().await;
        };
        let result = match tokio::time::timeout(deadline, stop).await {
            Ok(()) => Ok(()),
            Err(_) => {
                error!(timeout_ms = crate::utils::millis(deadline), "Kernel shutdown timed out");
                Err(KernelError::ShutdownTimeout(deadline))
            }
        };

        *self.inner.state.write() = KernelState::Stopped;
        info!("Kernel stopped");
        result
    }

    async fn teardown(&self) {
        self.fire(KERNEL_SHUTDOWN, Vec::new()).await;

        // started plugins in reverse start order, then anything else that
        // was initialised but never made it to running
        let mut order: Vec<String> = self.inner.start_order.read().iter().rev().cloned().collect();
        {
            let plugins = self.inner.plugins.read();
            for slot in plugins.iter().rev() {
                if slot.status.needs_destroy() && !order.contains(&slot.name) {
                    order.push(slot.name.clone());
                }
            }
        }
        for name in order {
            if let Err(err) = self.destroy_slot(&name, None).await {
                error!(plugin = %name, error = %err, "Destroy failed during shutdown");
            }
        }

        let handlers = self.inner.shutdown_handlers.lock().clone();
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(err) = handler().await {
                error!(handler = index, error = %err, "Shutdown handler failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Health & metrics
    // ------------------------------------------------------------------

    /// Probe one plugin, bounded by its lifecycle deadline.
    pub async fn check_plugin_health(&self, name: &str) -> KernelResult<PluginHealth> {
        let (plugin, status) = {
            let plugins = self.inner.plugins.read();
            let slot = plugins
                .iter()
                .find(|slot| slot.name == name)
                .ok_or_else(|| KernelError::PluginNotFound(name.to_string()))?;
            (slot.plugin.clone(), slot.status)
        };

        if status != PluginStatus::Running {
            return Ok(PluginHealth {
                plugin: name.to_string(),
                healthy: false,
                message: Some(format!("plugin is {status}")),
                latency: Duration::ZERO,
            });
        }

        let deadline = self.inner.runner.deadline_for(plugin.as_ref());
        let began = Instant::now();
        let outcome = tokio::time::timeout(deadline, plugin.health_check()).await;
        let latency = began.elapsed();

        let (healthy, message) = match outcome {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => (false, Some("health check reported unhealthy".to_string())),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_) => (
                false,
                Some(
                    KernelError::Timeout {
                        plugin: name.to_string(),
                        phase: LifecyclePhase::HealthCheck,
                        timeout: deadline,
                    }
                    .to_string(),
                ),
            ),
        };

        Ok(PluginHealth {
            plugin: name.to_string(),
            healthy,
            message,
            latency,
        })
    }

    /// Probe every plugin, in registration order.
    pub async fn check_all_plugins_health(&self) -> Vec<PluginHealth> {
        let mut report = Vec::new();
        for name in self.plugin_names() {
            match self.check_plugin_health(&name).await {
                Ok(health) => report.push(health),
                Err(err) => report.push(PluginHealth {
                    plugin: name,
                    healthy: false,
                    message: Some(err.to_string()),
                    latency: Duration::ZERO,
                }),
            }
        }
        report
    }

    /// Start duration of every plugin whose latest start succeeded.
    pub fn get_plugin_metrics(&self) -> HashMap<String, Duration> {
        self.inner
            .start_results
            .read()
            .iter()
            .filter(|result| result.success)
            .map(|result| (result.plugin.clone(), result.duration))
            .collect()
    }

    pub fn start_results(&self) -> Vec<PluginStartResult> {
        self.inner.start_results.read().clone()
    }

    /// Currently started plugins, in the order they started.
    pub fn start_order(&self) -> Vec<String> {
        self.inner.start_order.read().clone()
    }

    // ------------------------------------------------------------------
    // Per-plugin runtime operations
    // ------------------------------------------------------------------

    /// Destroy a single plugin of a running kernel. A plugin that is not
    /// active is left alone.
    pub async fn destroy_plugin(&self, name: &str) -> KernelResult<()> {
        self.require_running("destroy plugin")?;
        self.destroy_slot(name, None).await.map(|_| ())
    }

    /// [`Kernel::destroy_plugin`] with an explicit deadline.
    pub async fn destroy_plugin_within(&self, name: &str, deadline: Duration) -> KernelResult<()> {
        self.require_running("destroy plugin")?;
        self.destroy_slot(name, Some(deadline)).await.map(|_| ())
    }

    /// Initialise and start a registered or destroyed plugin again.
    pub async fn activate_plugin(&self, name: &str) -> KernelResult<()> {
        self.require_running("activate plugin")?;
        let plugin = self.claim(name, "activate")?;
        let ctx = PluginContext::new(name, self);

        let result = async {
            self.inner.runner.init(plugin.as_ref(), &ctx).await?;
            self.set_status(name, PluginStatus::Initialized);
            self.start_one(name, plugin.as_ref(), &ctx).await
        }
        .await;
        self.release(name);

        if result.is_ok() && self.state().is_terminal() {
            // shutdown began while we were activating
            self.destroy_slot(name, None).await?;
        }
        result
    }

    pub async fn restart_plugin(&self, name: &str) -> KernelResult<()> {
        info!(plugin = %name, "Restarting plugin");
        self.destroy_plugin(name).await?;
        self.activate_plugin(name).await
    }

    /// Swap the instance behind a destroyed plugin. The replacement must
    /// carry the same name; it is activated by [`Kernel::activate_plugin`].
    pub fn replace_plugin(&self, name: &str, plugin: Arc<dyn Plugin>) -> KernelResult<()> {
        if plugin.name() != name {
            return Err(PluginError::other(format!(
                "replacement for '{name}' is named '{}'",
                plugin.name()
            ))
            .into());
        }

        let mut plugins = self.inner.plugins.write();
        let slot = plugins
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| KernelError::PluginNotFound(name.to_string()))?;
        if slot.busy || slot.status.needs_destroy() {
            return Err(KernelError::InvalidPluginState {
                plugin: name.to_string(),
                operation: "replace",
                status: slot.status,
            });
        }
        debug!(plugin = %name, version = %plugin.metadata().version, "Plugin instance replaced");
        slot.plugin = plugin;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(
        &self,
        from: KernelState,
        to: KernelState,
        operation: &'static str,
    ) -> KernelResult<()> {
        let mut state = self.inner.state.write();
        if *state != from {
            return Err(KernelError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn require_running(&self, operation: &'static str) -> KernelResult<()> {
        let state = self.state();
        if state != KernelState::Running {
            return Err(KernelError::InvalidState { operation, state });
        }
        Ok(())
    }

    fn slot_plugin(&self, name: &str) -> KernelResult<Arc<dyn Plugin>> {
        self.plugin(name)
            .ok_or_else(|| KernelError::PluginNotFound(name.to_string()))
    }

    fn set_status(&self, name: &str, status: PluginStatus) {
        if let Some(slot) = self
            .inner
            .plugins
            .write()
            .iter_mut()
            .find(|slot| slot.name == name)
        {
            slot.status = status;
        }
    }

    /// Mark an inactive plugin as being activated.
    fn claim(&self, name: &str, operation: &'static str) -> KernelResult<Arc<dyn Plugin>> {
        let mut plugins = self.inner.plugins.write();
        let slot = plugins
            .iter_mut()
            .find(|slot| slot.name == name)
            .ok_or_else(|| KernelError::PluginNotFound(name.to_string()))?;
        if slot.busy || slot.status.needs_destroy() {
            return Err(KernelError::InvalidPluginState {
                plugin: name.to_string(),
                operation,
                status: slot.status,
            });
        }
        slot.busy = true;
        Ok(slot.plugin.clone())
    }

    fn release(&self, name: &str) {
        if let Some(slot) = self
            .inner
            .plugins
            .write()
            .iter_mut()
            .find(|slot| slot.name == name)
        {
            slot.busy = false;
        }
    }

    fn record_start(&self, name: &str, success: bool, duration: Duration, error: Option<String>) {
        let result = PluginStartResult {
            plugin: name.to_string(),
            success,
            duration,
            error,
        };
        let mut results = self.inner.start_results.write();
        match results.iter_mut().find(|r| r.plugin == name) {
            Some(existing) => *existing = result,
            None => results.push(result),
        }
    }

    /// Run `destroy` for `name` if it is still active. The status flips to
    /// `Destroyed` before the callback runs, so each activation is destroyed
    /// at most once even when the callback fails. Returns whether a destroy
    /// ran.
    async fn destroy_slot(&self, name: &str, deadline: Option<Duration>) -> KernelResult<bool> {
        let plugin = {
            let mut plugins = self.inner.plugins.write();
            let slot = plugins
                .iter_mut()
                .find(|slot| slot.name == name)
                .ok_or_else(|| KernelError::PluginNotFound(name.to_string()))?;
            if !slot.status.needs_destroy() {
                return Ok(false);
            }
            slot.status = PluginStatus::Destroyed;
            slot.plugin.clone()
        };
        self.inner.start_order.write().retain(|started| started != name);

        let result = match deadline {
            Some(deadline) => self.inner.runner.destroy_within(plugin.as_ref(), deadline).await,
            None => self.inner.runner.destroy(plugin.as_ref()).await,
        };
        if result.is_ok() {
            debug!(plugin = %name, "Plugin destroyed");
        }
        self.fire(PLUGIN_DESTROYED, vec![Value::from(name)]).await;
        result.map(|_| true)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state())
            .field("plugins", &self.plugin_names())
            .field("services", &self.inner.services)
            .finish()
    }
}
