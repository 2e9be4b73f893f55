//! Plexus kernel
//!
//! A plugin microkernel: registers plugins, orders them by their declared
//! dependencies, drives them through `init -> start -> destroy` with
//! per-phase deadlines and rollback, and exposes a name-keyed service
//! registry and hook table to every plugin through its [`PluginContext`].
//!
//! Supervision (health checks, restart backoff, signal handling) lives in
//! `plexus-runtime`; hot reload lives in `plexus-plugins`.

// plugin contract
pub mod plugin;
pub use plugin::{
    LifecyclePhase, Plugin, PluginError, PluginHealth, PluginMetadata, PluginResult,
    PluginStartResult, PluginStatus,
};

// context module
pub mod context;
pub use context::{PluginContext, PluginLogger};

pub mod dependency;
pub use dependency::{DependencyError, DependencyGraph, DependencyResolver};

// service registry
pub mod service;
pub use service::{
    AnyService, ServiceDependencies, ServiceDescriptor, ServiceFactory, ServiceLifecycle,
    ServiceRegistry,
};

pub mod hooks;
pub use hooks::{HookHandler, HookTable, hook_fn};

pub mod lifecycle;
pub use lifecycle::LifecycleRunner;

// kernel
pub mod kernel;
pub use kernel::{Kernel, KernelState, ShutdownHandler};

// error module
pub mod error;
pub use error::{KernelError, KernelResult, RegistrationError};

// configuration
pub mod config;
pub use config::{KernelConfig, LogFormat, LoggerConfig};

pub mod utils;
