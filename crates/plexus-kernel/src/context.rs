//! Context handed to every plugin callback.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::error::{KernelError, KernelResult};
use crate::hooks::HookHandler;
use crate::kernel::{Kernel, KernelInner};
use crate::service::AnyService;

/// A plugin's view of the kernel.
///
/// Holds a weak reference so a plugin that keeps its context around does
/// not keep the kernel alive. Every operation fails with
/// [`KernelError::KernelDropped`] once the kernel is gone.
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: String,
    kernel: Weak<KernelInner>,
    logger: PluginLogger,
}

impl PluginContext {
    pub fn new(plugin_name: &str, kernel: &Kernel) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            kernel: Arc::downgrade(kernel.inner()),
            logger: PluginLogger::new(plugin_name),
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The owning kernel, if it is still alive.
    pub fn get_kernel(&self) -> Option<Kernel> {
        self.kernel.upgrade().map(Kernel::from_inner)
    }

    fn kernel(&self) -> KernelResult<Kernel> {
        self.get_kernel().ok_or(KernelError::KernelDropped)
    }

    /// Register a service instance under `name`.
    pub fn register_service<T: Any + Send + Sync>(&self, name: &str, instance: T) -> KernelResult<()> {
        self.kernel()?.register_service(name, instance)
    }

    /// Register an already shared instance under `name`.
    pub fn register_shared_service(&self, name: &str, instance: AnyService) -> KernelResult<()> {
        self.kernel()?.register_shared_service(name, instance)
    }

    /// Typed lookup; fails if the service is absent or of another type.
    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> KernelResult<Arc<T>> {
        self.kernel()?.get_service(name)
    }

    pub async fn get_service_async<T: Any + Send + Sync>(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> KernelResult<Arc<T>> {
        self.kernel()?.get_service_async(name, scope).await
    }

    /// Snapshot of every materialised service.
    pub fn get_services(&self) -> HashMap<String, AnyService> {
        self.get_kernel()
            .map(|kernel| kernel.services().snapshot())
            .unwrap_or_default()
    }

    pub fn hook(&self, event: &str, handler: HookHandler) -> KernelResult<()> {
        self.kernel()?.hook(event, handler);
        Ok(())
    }

    /// Run every handler registered for `event`, sequentially.
    pub async fn trigger(&self, event: &str, args: Vec<Value>) -> KernelResult<()> {
        self.kernel()?.trigger(event, args).await
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_name", &self.plugin_name)
            .field("kernel_alive", &(self.kernel.strong_count() > 0))
            .finish()
    }
}

/// `tracing` front-end tagging every event with the plugin name.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
}

impl PluginLogger {
    pub fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin, "{}", message);
    }
}
