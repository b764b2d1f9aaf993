//! Graceful shutdown handling
//!
//! One [`ShutdownCoordinator`] per process hands out [`ShutdownSignal`]s to
//! the HTTP server, the queue workers and the reconciliation scheduler. On
//! SIGINT/SIGTERM every holder observes the signal and winds down; the
//! coordinator then waits for the background tasks it tracks.

use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cloneable view of the shutdown state
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been initiated
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Track a background task so shutdown waits for it
    pub async fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.into(), handle));
    }

    pub fn shutdown(&self) {
        if self.tx.send_replace(true) {
            return;
        }
        info!("Initiating graceful shutdown...");
    }

    /// Signal shutdown and wait up to `drain_timeout` for tracked tasks
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) {
        self.shutdown();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for (name, handle) in tasks {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => info!(task = %name, "Background task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Background task panicked"),
                Err(_) => warn!(task = %name, "Timed out waiting for background task"),
            }
        }

        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}

/// Spawn `task`, dropping it when shutdown is signaled
pub fn spawn_until_shutdown<F>(signal: ShutdownSignal, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.wait() => {}
            _ = task => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_observes_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        assert!(!signal.is_shutdown());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        coordinator.shutdown();
        waiter.await.unwrap();
        assert!(signal.is_shutdown());
        assert!(coordinator.is_shutdown());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_tracked_tasks() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        let handle = tokio::spawn(async move { signal.wait().await });
        coordinator.track("worker", handle).await;

        coordinator
            .graceful_shutdown(Duration::from_secs(1))
            .await;
        assert!(coordinator.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_until_shutdown_stops_long_task() {
        let coordinator = ShutdownCoordinator::new();
        let handle = spawn_until_shutdown(coordinator.signal(), std::future::pending());
        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
