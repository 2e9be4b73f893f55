//! Named event hooks.
//!
//! Handlers for an event run one at a time, in the order they were
//! registered. Arguments travel as JSON values so plugins do not need to
//! share types to talk to each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

use crate::plugin::{PluginError, PluginResult};

/// Fired after every plugin started and system services were validated.
pub const KERNEL_READY: &str = "kernel:ready";
/// Fired first thing during shutdown, before any plugin is destroyed.
pub const KERNEL_SHUTDOWN: &str = "kernel:shutdown";
/// Fired after a plugin's `start` completed; argument is the plugin name.
pub const PLUGIN_STARTED: &str = "plugin:started";
/// Fired after a plugin's `destroy` ran; argument is the plugin name.
pub const PLUGIN_DESTROYED: &str = "plugin:destroyed";

/// An async hook handler.
pub type HookHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, PluginResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`HookHandler`].
pub fn hook_fn<F, Fut>(f: F) -> HookHandler
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PluginResult<()>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Event name -> handlers in registration order.
#[derive(Default)]
pub struct HookTable {
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: HookHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map(Vec::len).unwrap_or(0)
    }

    /// Run every handler for `event` sequentially. Stops at the first
    /// failing handler and returns its error.
    pub async fn trigger(&self, event: &str, args: Vec<Value>) -> Result<(), PluginError> {
        // Snapshot so handlers may register further hooks without deadlocking.
        let handlers = self.handlers.read().get(event).cloned().unwrap_or_default();
        for handler in handlers {
            handler(args.clone()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let mut events: Vec<_> = handlers.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        events.sort();
        f.debug_struct("HookTable").field("events", &events).finish()
    }
}
