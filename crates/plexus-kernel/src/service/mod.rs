//! Service registry
//!
//! A name-keyed store of service instances and factories used for dependency
//! injection between plugins.
//!
//! Services are stored type-erased as [`AnyService`]. Registration does not
//! record a type; the caller names the expected type at lookup and the
//! registry downcasts, reporting [`KernelError::ServiceTypeMismatch`] when
//! the guess is wrong. Nothing else about a service's shape is checked.
//!
//! Factories come in two flavours. Synchronous factories can be resolved
//! from the synchronous getter; async factories (or any chain that reaches
//! one through declared dependencies) need [`ServiceRegistry::resolve_async`].

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::dependency::DependencyError;
use crate::error::{KernelError, KernelResult, RegistrationError};

/// A type-erased, shareable service instance.
pub type AnyService = Arc<dyn Any + Send + Sync>;

type SyncFactoryFn = dyn Fn(&ServiceDependencies) -> KernelResult<AnyService> + Send + Sync;
type AsyncFactoryFn =
    dyn Fn(ServiceDependencies) -> BoxFuture<'static, KernelResult<AnyService>> + Send + Sync;

/// Caching policy for instances produced by a factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLifecycle {
    /// Produced once and shared
    #[default]
    Singleton,
    /// Produced on every resolution
    Transient,
    /// Produced once per caller-supplied scope id
    Scoped,
}

impl fmt::Display for ServiceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceLifecycle::Singleton => write!(f, "singleton"),
            ServiceLifecycle::Transient => write!(f, "transient"),
            ServiceLifecycle::Scoped => write!(f, "scoped"),
        }
    }
}

/// A service producer
#[derive(Clone)]
pub enum ServiceFactory {
    Sync(Arc<SyncFactoryFn>),
    Async(Arc<AsyncFactoryFn>),
}

impl ServiceFactory {
    /// Wrap a synchronous constructor.
    pub fn from_fn<T, F>(f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceDependencies) -> KernelResult<T> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(move |deps| {
            f(deps).map(|value| Arc::new(value) as AnyService)
        }))
    }

    /// Wrap an async constructor.
    pub fn from_async_fn<T, F, Fut>(f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(ServiceDependencies) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KernelResult<T>> + Send + 'static,
    {
        Self::Async(Arc::new(move |deps| {
            let fut = f(deps);
            Box::pin(async move { fut.await.map(|value| Arc::new(value) as AnyService) })
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ServiceFactory::Async(_))
    }
}

impl fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFactory::Sync(_) => write!(f, "ServiceFactory::Sync"),
            ServiceFactory::Async(_) => write!(f, "ServiceFactory::Async"),
        }
    }
}

/// Resolved dependencies handed to a factory.
#[derive(Clone, Default)]
pub struct ServiceDependencies {
    resolved: HashMap<String, AnyService>,
}

impl ServiceDependencies {
    /// Typed access to a declared dependency.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> KernelResult<Arc<T>> {
        let service = self
            .resolved
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::ServiceNotFound(name.to_string()))?;
        downcast(name, service)
    }

    pub fn get_any(&self, name: &str) -> Option<AnyService> {
        self.resolved.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

/// Registered factory plus its declared dependencies
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub factory: ServiceFactory,
    pub lifecycle: ServiceLifecycle,
    pub dependencies: Vec<String>,
}

struct FactoryEntry {
    descriptor: ServiceDescriptor,
    /// Materialised singleton
    singleton: Arc<OnceCell<AnyService>>,
}

/// Name-keyed store of service instances and factories.
#[derive(Default)]
pub struct ServiceRegistry {
    instances: RwLock<HashMap<String, AnyService>>,
    factories: RwLock<HashMap<String, FactoryEntry>>,
    /// scope id -> service name -> instance
    scoped: RwLock<HashMap<String, HashMap<String, AnyService>>>,
    /// Registration order, for deterministic listings
    order: RwLock<Vec<String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready-made instance. Fails if the name is taken.
    pub fn register(&self, name: &str, instance: AnyService) -> KernelResult<()> {
        let factories = self.factories.read();
        let mut instances = self.instances.write();
        if instances.contains_key(name) || factories.contains_key(name) {
            return Err(RegistrationError::DuplicateService(name.to_string()).into());
        }
        instances.insert(name.to_string(), instance);
        self.order.write().push(name.to_string());
        debug!(service = name, "Service registered");
        Ok(())
    }

    /// Register a producer instead of a value. Fails if the name is taken.
    pub fn register_factory(
        &self,
        name: &str,
        factory: ServiceFactory,
        lifecycle: ServiceLifecycle,
        dependencies: Vec<String>,
    ) -> KernelResult<()> {
        let mut factories = self.factories.write();
        let instances = self.instances.read();
        if instances.contains_key(name) || factories.contains_key(name) {
            return Err(RegistrationError::DuplicateService(name.to_string()).into());
        }
        let entry = FactoryEntry {
            descriptor: ServiceDescriptor {
                name: name.to_string(),
                factory,
                lifecycle,
                dependencies,
            },
            singleton: Arc::new(OnceCell::new()),
        };
        factories.insert(name.to_string(), entry);
        self.order.write().push(name.to_string());
        debug!(service = name, %lifecycle, "Service factory registered");
        Ok(())
    }

    /// Non-failing existence check, for instances and factories alike.
    pub fn has(&self, name: &str) -> bool {
        self.instances.read().contains_key(name) || self.factories.read().contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<ServiceDescriptor> {
        self.factories
            .read()
            .get(name)
            .map(|entry| entry.descriptor.clone())
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Every instance that exists right now: registered instances plus
    /// materialised singletons. Factories are not invoked.
    pub fn snapshot(&self) -> HashMap<String, AnyService> {
        let mut out = self.instances.read().clone();
        for (name, entry) in self.factories.read().iter() {
            if let Some(instance) = entry.singleton.get() {
                out.insert(name.clone(), instance.clone());
            }
        }
        out
    }

    /// Typed synchronous lookup.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> KernelResult<Arc<T>> {
        downcast(name, self.resolve(name, None)?)
    }

    /// Typed async lookup, with an optional scope id for scoped services.
    pub async fn get_async<T: Any + Send + Sync>(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> KernelResult<Arc<T>> {
        downcast(name, self.resolve_async(name, scope).await?)
    }

    /// Synchronous resolution. Fails with [`KernelError::AsyncServiceRequired`]
    /// when the chain would need to await an async factory.
    pub fn resolve(&self, name: &str, scope: Option<&str>) -> KernelResult<AnyService> {
        let mut stack = Vec::new();
        self.resolve_sync_inner(name, scope, &mut stack)
    }

    fn resolve_sync_inner(
        &self,
        name: &str,
        scope: Option<&str>,
        stack: &mut Vec<String>,
    ) -> KernelResult<AnyService> {
        if let Some(instance) = self.instances.read().get(name) {
            return Ok(instance.clone());
        }

        let (descriptor, cell) = self.lookup_factory(name)?;

        match descriptor.lifecycle {
            ServiceLifecycle::Singleton => {
                if let Some(instance) = cell.get() {
                    return Ok(instance.clone());
                }
            }
            ServiceLifecycle::Scoped => {
                let scope = scope.ok_or_else(|| KernelError::ScopeRequired(name.to_string()))?;
                if let Some(instance) = self.scoped_instance(scope, name) {
                    return Ok(instance);
                }
            }
            ServiceLifecycle::Transient => {}
        }

        let ServiceFactory::Sync(factory) = &descriptor.factory else {
            return Err(KernelError::AsyncServiceRequired(name.to_string()));
        };

        enter(stack, name)?;
        let mut deps = ServiceDependencies::default();
        for dep in &descriptor.dependencies {
            let resolved = match self.resolve_sync_inner(dep, scope, stack) {
                Err(KernelError::AsyncServiceRequired(_)) => {
                    Err(KernelError::AsyncServiceRequired(name.to_string()))
                }
                other => other,
            }?;
            deps.resolved.insert(dep.clone(), resolved);
        }
        stack.pop();

        let instance = factory(&deps)?;
        Ok(self.cache(&descriptor, &cell, scope, instance))
    }

    /// Async resolution; awaits async factories along the chain.
    pub async fn resolve_async(&self, name: &str, scope: Option<&str>) -> KernelResult<AnyService> {
        let mut stack = Vec::new();
        self.resolve_async_inner(name, scope, &mut stack).await
    }

    fn resolve_async_inner<'a>(
        &'a self,
        name: &'a str,
        scope: Option<&'a str>,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, KernelResult<AnyService>> {
        Box::pin(async move {
            if let Some(instance) = self.instances.read().get(name).cloned() {
                return Ok(instance);
            }

            let (descriptor, cell) = self.lookup_factory(name)?;

            match descriptor.lifecycle {
                ServiceLifecycle::Singleton => {
                    enter(stack, name)?;
                    let result = cell
                        .get_or_try_init(|| self.produce(&descriptor, scope, stack))
                        .await
                        .cloned();
                    stack.pop();
                    result
                }
                ServiceLifecycle::Scoped => {
                    let scope =
                        scope.ok_or_else(|| KernelError::ScopeRequired(name.to_string()))?;
                    if let Some(instance) = self.scoped_instance(scope, name) {
                        return Ok(instance);
                    }
                    enter(stack, name)?;
                    let produced = self.produce(&descriptor, Some(scope), stack).await;
                    stack.pop();
                    Ok(self.cache(&descriptor, &cell, Some(scope), produced?))
                }
                ServiceLifecycle::Transient => {
                    enter(stack, name)?;
                    let produced = self.produce(&descriptor, scope, stack).await;
                    stack.pop();
                    produced
                }
            }
        })
    }

    /// Resolve declared dependencies, then invoke the factory. Factory errors
    /// are returned untouched.
    async fn produce(
        &self,
        descriptor: &ServiceDescriptor,
        scope: Option<&str>,
        stack: &mut Vec<String>,
    ) -> KernelResult<AnyService> {
        let mut deps = ServiceDependencies::default();
        for dep in &descriptor.dependencies {
            let resolved = self.resolve_async_inner(dep, scope, stack).await?;
            deps.resolved.insert(dep.clone(), resolved);
        }

        match &descriptor.factory {
            ServiceFactory::Sync(factory) => factory(&deps),
            ServiceFactory::Async(factory) => factory(deps).await,
        }
    }

    fn lookup_factory(
        &self,
        name: &str,
    ) -> KernelResult<(ServiceDescriptor, Arc<OnceCell<AnyService>>)> {
        self.factories
            .read()
            .get(name)
            .map(|entry| (entry.descriptor.clone(), entry.singleton.clone()))
            .ok_or_else(|| KernelError::ServiceNotFound(name.to_string()))
    }

    fn scoped_instance(&self, scope: &str, name: &str) -> Option<AnyService> {
        self.scoped
            .read()
            .get(scope)
            .and_then(|services| services.get(name))
            .cloned()
    }

    /// Store a freshly produced instance according to its lifecycle and return
    /// the instance callers should see (the first one wins on a race).
    fn cache(
        &self,
        descriptor: &ServiceDescriptor,
        cell: &OnceCell<AnyService>,
        scope: Option<&str>,
        instance: AnyService,
    ) -> AnyService {
        match (descriptor.lifecycle, scope) {
            (ServiceLifecycle::Singleton, _) => match cell.set(instance.clone()) {
                Ok(()) => instance,
                Err(_) => cell.get().cloned().unwrap_or(instance),
            },
            (ServiceLifecycle::Scoped, Some(scope)) => self
                .scoped
                .write()
                .entry(scope.to_string())
                .or_default()
                .entry(descriptor.name.clone())
                .or_insert(instance)
                .clone(),
            _ => instance,
        }
    }

    /// Drop every instance cached for `scope`.
    pub fn clear_scope(&self, scope: &str) -> usize {
        self.scoped
            .write()
            .remove(scope)
            .map(|services| services.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

fn enter(stack: &mut Vec<String>, name: &str) -> KernelResult<()> {
    if let Some(pos) = stack.iter().position(|n| n == name) {
        let mut path = stack[pos..].to_vec();
        path.push(name.to_string());
        return Err(DependencyError::CircularDependency {
            plugin: name.to_string(),
            path,
        }
        .into());
    }
    stack.push(name.to_string());
    Ok(())
}

fn downcast<T: Any + Send + Sync>(name: &str, service: AnyService) -> KernelResult<Arc<T>> {
    service
        .downcast::<T>()
        .map_err(|_| KernelError::ServiceTypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        })
}
