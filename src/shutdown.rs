//! Graceful shutdown handling for the lock server.
//!
//! A [`ShutdownCoordinator`] is a watch channel over a single stop flag: the
//! accept loop and background tasks call [`ShutdownCoordinator::wait`] while
//! anything may raise the flag, programmatically or from an OS signal via
//! [`wait_for_signal`].

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Coordinates graceful termination across server tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Request shutdown. Idempotent; only the first call is logged.
    pub fn shutdown(&self) {
        let raised = self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if raised {
            info!("shutdown requested, draining tasks");
        }
    }

    /// Wait until shutdown is requested. Returns immediately if it already
    /// was.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Raise the coordinator's flag when a termination signal arrives.
///
/// Each signal gets its own watcher task, so this resolves as soon as the
/// coordinator trips for any reason, signal or programmatic.
#[cfg(unix)]
pub async fn wait_for_signal(coordinator: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    let watched = [
        ("terminate", SignalKind::terminate()),
        ("interrupt", SignalKind::interrupt()),
        ("quit", SignalKind::quit()),
    ];

    for (name, kind) in watched {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(signal = name, error = %e, "cannot watch signal");
                continue;
            }
        };
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                info!(signal = name, "stop signal caught");
                coordinator.shutdown();
            }
        });
    }

    coordinator.wait().await;
}

/// Raise the coordinator's flag on Ctrl+C (Windows version).
#[cfg(windows)]
pub async fn wait_for_signal(coordinator: ShutdownCoordinator) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("stop signal caught");
    }
    coordinator.shutdown();
}
