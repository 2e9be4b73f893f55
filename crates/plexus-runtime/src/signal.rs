//! Process-signal driven kernel shutdown.
//!
//! The first terminate signal runs [`Kernel::shutdown`] once. Signals that
//! arrive while that shutdown is in flight are logged and ignored. When it
//! completes the exit hook receives `0` on success and `1` on failure.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use plexus_kernel::Kernel;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives the process exit code once shutdown finished.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Exit hook that terminates the process.
pub fn process_exit() -> ExitHook {
    Arc::new(exit_process)
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

/// Wait for Ctrl-C or SIGTERM, shut `kernel` down and exit the process.
pub async fn shutdown_on_signal(kernel: Kernel) -> i32 {
    shutdown_on(kernel, os_signals(), process_exit()).await
}

/// Spawn [`shutdown_on_signal`] when the kernel is configured for graceful
/// shutdown.
pub fn install(kernel: &Kernel) -> Option<JoinHandle<i32>> {
    if !kernel.config().graceful_shutdown {
        debug!("Graceful shutdown disabled, not listening for signals");
        return None;
    }
    Some(tokio::spawn(shutdown_on_signal(kernel.clone())))
}

/// Drive one shutdown from the first item of `signals`; returns the exit
/// code handed to `exit`.
pub async fn shutdown_on<S>(kernel: Kernel, signals: S, exit: ExitHook) -> i32
where
    S: Stream<Item = ()> + Send,
{
    let mut signals = std::pin::pin!(signals);

    if signals.next().await.is_none() {
        debug!("Signal source closed before any signal arrived");
        return EXIT_SUCCESS;
    }
    info!("Termination signal received, shutting down kernel");

    let shutdown = kernel.shutdown();
    let mut shutdown = std::pin::pin!(shutdown);
    let mut signals_open = true;

    let result = loop {
        tokio::select! {
            result = &mut shutdown => break result,
            next = signals.next(), if signals_open => match next {
                Some(()) => warn!("Shutdown already in progress, ignoring signal"),
                None => signals_open = false,
            },
        }
    };

    let code = match result {
        Ok(()) => {
            info!("Kernel shut down cleanly");
            EXIT_SUCCESS
        }
        Err(err) => {
            error!(error = %err, "Kernel shutdown failed");
            EXIT_FAILURE
        }
    };
    exit(code);
    code
}

/// Endless stream yielding once per Ctrl-C / SIGTERM.
pub fn os_signals() -> impl Stream<Item = ()> + Send {
    futures::stream::unfold((), |()| async {
        wait_for_signal().await;
        Some(((), ()))
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "Cannot listen for SIGTERM, falling back to Ctrl-C only");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
