//! Scriptable plugin double for kernel integration tests.
//!
//! [`MockPlugin`] appends `"<phase>:<name>"` to a shared [`CallLog`] on every
//! callback, so tests can assert on the exact order the kernel drove
//! plugins in. Delays and failures are configured per phase through the
//! builder.
//!
//! ```rust,ignore
//! let log = CallLog::default();
//! let db = MockPlugin::builder("db").log(&log).build();
//! let api = MockPlugin::builder("api").depends_on("db").fail_start().build();
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use plexus_kernel::{
    KernelConfig, Plugin, PluginContext, PluginError, PluginMetadata, PluginResult,
};

/// Ordered record of callback invocations shared between plugins.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Plugin names logged for one phase, in call order.
    pub fn phase(&self, phase: &str) -> Vec<String> {
        let prefix = format!("{phase}:");
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Default, Clone)]
struct Script {
    init_delay: Option<Duration>,
    start_delay: Option<Duration>,
    fail_init: bool,
    fail_start: bool,
    fail_destroy: bool,
    healthy: Option<Arc<std::sync::atomic::AtomicBool>>,
    service: Option<(String, u32)>,
}

pub struct MockPlugin {
    metadata: PluginMetadata,
    log: CallLog,
    script: Script,
    destroy_calls: Arc<AtomicUsize>,
}

impl MockPlugin {
    pub fn builder(name: &str) -> MockPluginBuilder {
        MockPluginBuilder {
            metadata: PluginMetadata::new(name).with_version("1.0.0"),
            log: CallLog::default(),
            script: Script::default(),
        }
    }

    pub fn destroy_calls(&self) -> Arc<AtomicUsize> {
        self.destroy_calls.clone()
    }
}

pub struct MockPluginBuilder {
    metadata: PluginMetadata,
    log: CallLog,
    script: Script,
}

impl MockPluginBuilder {
    pub fn log(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.metadata = self.metadata.with_dependency(dep);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.metadata = self.metadata.with_startup_timeout(timeout);
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.script.init_delay = Some(delay);
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.script.start_delay = Some(delay);
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.script.fail_init = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.script.fail_start = true;
        self
    }

    pub fn fail_destroy(mut self) -> Self {
        self.script.fail_destroy = true;
        self
    }

    pub fn health_flag(mut self, flag: Arc<std::sync::atomic::AtomicBool>) -> Self {
        self.script.healthy = Some(flag);
        self
    }

    /// Register a `u32` service during `init`.
    pub fn provides(mut self, service: &str, value: u32) -> Self {
        self.script.service = Some((service.to_string(), value));
        self
    }

    pub fn build(self) -> MockPlugin {
        MockPlugin {
            metadata: self.metadata,
            log: self.log,
            script: self.script,
            destroy_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn init(&self, ctx: &PluginContext) -> PluginResult<()> {
        if let Some(delay) = self.script.init_delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("init:{}", self.name()));
        if self.script.fail_init {
            return Err(PluginError::InitFailed(format!("{} refused to init", self.name())));
        }
        if let Some((name, value)) = &self.script.service {
            ctx.register_service(name, *value)
                .map_err(|e| PluginError::InitFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn start(&self, _ctx: &PluginContext) -> PluginResult<()> {
        if let Some(delay) = self.script.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("start:{}", self.name()));
        if self.script.fail_start {
            return Err(PluginError::StartFailed(format!("{} refused to start", self.name())));
        }
        Ok(())
    }

    async fn destroy(&self) -> PluginResult<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("destroy:{}", self.name()));
        if self.script.fail_destroy {
            return Err(PluginError::DestroyFailed(format!("{} refused to die", self.name())));
        }
        Ok(())
    }

    async fn health_check(&self) -> PluginResult<bool> {
        Ok(self
            .script
            .healthy
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(true))
    }
}

/// Kernel config for tests that do not register the well-known system
/// services.
pub fn test_config() -> KernelConfig {
    KernelConfig::default().with_skip_system_validation(true)
}
