//! Shutdown ordering, best-effort teardown and the shutdown deadline.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::mock_plugin::{CallLog, MockPlugin, test_config};
use plexus_kernel::hooks::KERNEL_SHUTDOWN;
use plexus_kernel::{
    Kernel, KernelError, KernelState, PluginError, PluginStatus, RegistrationError, hook_fn,
};

async fn running_kernel(log: &CallLog, config: plexus_kernel::KernelConfig) -> Kernel {
    let kernel = Kernel::new(config);
    kernel
        .use_plugin(MockPlugin::builder("db").log(log).build())
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("auth").depends_on("db").log(log).build())
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("api").depends_on("auth").log(log).build())
        .unwrap();
    kernel.bootstrap().await.unwrap();
    kernel
}

#[tokio::test]
async fn test_shutdown_destroys_in_reverse_start_order() {
    let log = CallLog::default();
    let kernel = running_kernel(&log, test_config()).await;

    kernel.shutdown().await.unwrap();

    assert_eq!(log.phase("destroy"), vec!["api", "auth", "db"]);
    assert_eq!(kernel.state(), KernelState::Stopped);
    assert!(!kernel.is_running());
}

#[tokio::test]
async fn test_use_and_bootstrap_fail_after_shutdown() {
    let log = CallLog::default();
    let kernel = running_kernel(&log, test_config()).await;
    kernel.shutdown().await.unwrap();

    let err = kernel
        .use_plugin(MockPlugin::builder("late").build())
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Registration(RegistrationError::Closed {
            state: KernelState::Stopped,
            ..
        })
    ));

    let err = kernel.bootstrap().await.unwrap_err();
    assert!(matches!(
        err,
        KernelError::InvalidState {
            state: KernelState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_repeated_shutdown_is_noop() {
    let log = CallLog::default();
    let kernel = running_kernel(&log, test_config()).await;

    kernel.shutdown().await.unwrap();
    kernel.shutdown().await.unwrap();

    assert_eq!(log.phase("destroy").len(), 3);
}

#[tokio::test]
async fn test_failing_destroy_does_not_block_others() {
    let log = CallLog::default();
    let kernel = Kernel::new(test_config());
    kernel
        .use_plugin(MockPlugin::builder("a").log(&log).build())
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("b").fail_destroy().log(&log).build())
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("c").log(&log).build())
        .unwrap();
    kernel.bootstrap().await.unwrap();

    kernel.shutdown().await.unwrap();
    assert_eq!(log.phase("destroy"), vec!["c", "b", "a"]);
    assert_eq!(kernel.state(), KernelState::Stopped);
}

#[tokio::test]
async fn test_shutdown_hook_then_destroys_then_handlers() {
    let log = CallLog::default();
    let kernel = running_kernel(&log, test_config()).await;

    let hook_log = log.clone();
    kernel.hook(
        KERNEL_SHUTDOWN,
        hook_fn(move |_| {
            let log = hook_log.clone();
            async move {
                log.push("hook:shutdown".to_string());
                Ok(())
            }
        }),
    );

    let handler_log = log.clone();
    kernel.on_shutdown(move || {
        let log = handler_log.clone();
        async move {
            log.push("handler:first".to_string());
            Err(PluginError::other("flush failed"))
        }
    });
    let handler_log = log.clone();
    kernel.on_shutdown(move || {
        let log = handler_log.clone();
        async move {
            log.push("handler:second".to_string());
            Ok(())
        }
    });

    kernel.shutdown().await.unwrap();

    let entries = log.entries();
    let tail: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .skip_while(|e| !e.starts_with("hook:"))
        .collect();
    assert_eq!(
        tail,
        vec![
            "hook:shutdown",
            "destroy:api",
            "destroy:auth",
            "destroy:db",
            "handler:first",
            "handler:second"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_still_stops() {
    let log = CallLog::default();
    let kernel = running_kernel(
        &log,
        test_config().with_shutdown_timeout(Duration::from_millis(200)),
    )
    .await;

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    kernel.on_shutdown(move || {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let began = tokio::time::Instant::now();
    let err = kernel.shutdown().await.unwrap_err();

    assert!(matches!(err, KernelError::ShutdownTimeout(d) if d == Duration::from_millis(200)));
    assert!(began.elapsed() < Duration::from_secs(10));
    assert_eq!(kernel.state(), KernelState::Stopped);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    // plugins were destroyed before the slow handler
    assert_eq!(log.phase("destroy").len(), 3);
}

#[tokio::test]
async fn test_shutdown_from_idle() {
    let kernel = Kernel::new(test_config());
    kernel.shutdown().await.unwrap();
    assert_eq!(kernel.state(), KernelState::Stopped);
}

#[tokio::test]
async fn test_start_failed_plugin_destroyed_on_shutdown() {
    let log = CallLog::default();
    let kernel = Kernel::new(test_config().with_rollback_on_failure(false));
    kernel
        .use_plugin(MockPlugin::builder("ok").log(&log).build())
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("broken").fail_start().log(&log).build())
        .unwrap();
    kernel.bootstrap().await.unwrap();

    kernel.shutdown().await.unwrap();
    assert_eq!(log.phase("destroy"), vec!["ok", "broken"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_bootstrap_leaves_nothing_running() {
    let log = CallLog::default();
    let kernel = Kernel::new(test_config());
    kernel
        .use_plugin(
            MockPlugin::builder("a")
                .start_delay(Duration::from_millis(100))
                .log(&log)
                .build(),
        )
        .unwrap();
    kernel
        .use_plugin(MockPlugin::builder("b").depends_on("a").log(&log).build())
        .unwrap();

    let booting = kernel.clone();
    let bootstrap = tokio::spawn(async move { booting.bootstrap().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(kernel.state(), KernelState::Initializing);

    kernel.shutdown().await.unwrap();
    let err = bootstrap.await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        KernelError::InvalidState {
            operation: "bootstrap",
            ..
        }
    ));
    assert_eq!(kernel.state(), KernelState::Stopped);
    assert_eq!(
        log.entries(),
        vec!["init:a", "init:b", "start:a", "destroy:a", "destroy:b"]
    );
    assert!(kernel.start_order().is_empty());
    for name in ["a", "b"] {
        assert_eq!(kernel.plugin_status(name), Some(PluginStatus::Destroyed));
    }
}
