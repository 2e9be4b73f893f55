//! Kernel services, health probes and per-plugin operations on a running
//! kernel.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::mock_plugin::{CallLog, MockPlugin, test_config};
use plexus_kernel::{
    Kernel, KernelError, PluginStatus, RegistrationError, ServiceFactory, ServiceLifecycle,
};

struct Cache {
    name: &'static str,
}

#[test]
fn test_duplicate_service_registration() {
    let kernel = Kernel::new(test_config());
    kernel.register_service("cache", Cache { name: "A" }).unwrap();

    let err = kernel
        .register_service("cache", Cache { name: "B" })
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Registration(RegistrationError::DuplicateService(_))
    ));
    assert_eq!(kernel.get_service::<Cache>("cache").unwrap().name, "A");
}

#[test]
fn test_unknown_service() {
    let kernel = Kernel::new(test_config());
    assert!(matches!(
        kernel.get_service::<Cache>("cache"),
        Err(KernelError::ServiceNotFound(_))
    ));
}

#[tokio::test]
async fn test_kernel_factory_services() {
    let kernel = Kernel::new(test_config());
    kernel.register_service("prefix", String::from("tenant")).unwrap();
    kernel
        .register_service_factory(
            "session",
            ServiceFactory::from_async_fn(|deps| async move {
                let prefix = deps.get::<String>("prefix")?;
                Ok::<_, KernelError>(format!("{prefix}-session"))
            }),
            ServiceLifecycle::Scoped,
            vec!["prefix".to_string()],
        )
        .unwrap();

    let session = kernel
        .get_service_async::<String>("session", Some("req-1"))
        .await
        .unwrap();
    assert_eq!(session.as_str(), "tenant-session");
    assert!(matches!(
        kernel.get_service::<String>("session"),
        Err(KernelError::ScopeRequired(_))
    ));
}

#[tokio::test]
async fn test_plugins_share_services_through_context() {
    let kernel = Kernel::new(test_config());
    kernel
        .use_plugin(MockPlugin::builder("db").provides("pool", 8).build())
        .unwrap();
    kernel.bootstrap().await.unwrap();

    assert_eq!(*kernel.get_service::<u32>("pool").unwrap(), 8);
}

#[tokio::test]
async fn test_health_probes() {
    let flag = Arc::new(AtomicBool::new(true));
    let kernel = Kernel::new(test_config());
    kernel
        .use_plugin(MockPlugin::builder("db").health_flag(flag.clone()).build())
        .unwrap();
    kernel.use_plugin(MockPlugin::builder("api").build()).unwrap();

    // not started yet
    let health = kernel.check_plugin_health("db").await.unwrap();
    assert!(!health.healthy);

    kernel.bootstrap().await.unwrap();
    assert!(kernel.check_plugin_health("db").await.unwrap().healthy);

    flag.store(false, Ordering::SeqCst);
    let all = kernel.check_all_plugins_health().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].plugin, "db");
    assert!(!all[0].healthy);
    assert!(all[1].healthy);

    assert!(matches!(
        kernel.check_plugin_health("ghost").await,
        Err(KernelError::PluginNotFound(_))
    ));
}

#[tokio::test]
async fn test_restart_plugin() {
    let log = CallLog::default();
    let kernel = Kernel::new(test_config());
    let plugin = MockPlugin::builder("worker").log(&log).build();
    let destroys = plugin.destroy_calls();
    kernel.use_plugin(plugin).unwrap();
    kernel.bootstrap().await.unwrap();

    kernel.restart_plugin("worker").await.unwrap();

    assert_eq!(log.phase("init"), vec!["worker", "worker"]);
    assert_eq!(log.phase("start"), vec!["worker", "worker"]);
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.plugin_status("worker"), Some(PluginStatus::Running));
    assert_eq!(kernel.start_order(), vec!["worker"]);
}

#[tokio::test]
async fn test_replace_requires_destroyed_plugin() {
    let log = CallLog::default();
    let kernel = Kernel::new(test_config());
    kernel
        .use_plugin(MockPlugin::builder("svc").log(&log).build())
        .unwrap();
    kernel.bootstrap().await.unwrap();

    let replacement: Arc<dyn plexus_kernel::Plugin> =
        Arc::new(MockPlugin::builder("svc").log(&log).build());
    assert!(matches!(
        kernel.replace_plugin("svc", replacement.clone()),
        Err(KernelError::InvalidPluginState { .. })
    ));

    kernel.destroy_plugin("svc").await.unwrap();
    kernel.replace_plugin("svc", replacement.clone()).unwrap();
    kernel.activate_plugin("svc").await.unwrap();

    assert!(Arc::ptr_eq(&kernel.plugin("svc").unwrap(), &replacement));
    assert_eq!(log.phase("start"), vec!["svc", "svc"]);

    let misnamed: Arc<dyn plexus_kernel::Plugin> = Arc::new(MockPlugin::builder("other").build());
    assert!(kernel.replace_plugin("svc", misnamed).is_err());
}

#[tokio::test]
async fn test_activate_running_plugin_is_rejected() {
    let kernel = Kernel::new(test_config());
    kernel.use_plugin(MockPlugin::builder("p").build()).unwrap();
    kernel.bootstrap().await.unwrap();

    assert!(matches!(
        kernel.activate_plugin("p").await,
        Err(KernelError::InvalidPluginState {
            status: PluginStatus::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn test_runtime_ops_require_running_kernel() {
    let kernel = Kernel::new(test_config());
    kernel.use_plugin(MockPlugin::builder("p").build()).unwrap();

    assert!(matches!(
        kernel.restart_plugin("p").await,
        Err(KernelError::InvalidState { .. })
    ));
}
