//! Process lifecycle and graceful shutdown.
//!
//! On Ctrl+C or SIGTERM the shutdown broadcast is sent and every background
//! task gets 10 seconds to finish. The outbox worker is joined last so that
//! side effects queued by the final commands are still executed.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A spawned background task with a name for logs.
pub struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

impl NamedTask {
    /// Label a task handle.
    #[must_use]
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}

/// Running service: background tasks plus the shutdown broadcaster.
pub struct Application {
    tasks: Vec<NamedTask>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Application {
    /// Wrap already-spawned tasks, joined in the given order.
    #[must_use]
    pub const fn new(tasks: Vec<NamedTask>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { tasks, shutdown_tx }
    }

    /// Number of managed tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Block until a termination signal, then shut down.
    pub async fn run(self) {
        info!(tasks = self.tasks.len(), "Stockroom running");
        shutdown_signal().await;
        self.shutdown().await;
    }

    /// Broadcast shutdown and join every task.
    pub async fn shutdown(self) {
        info!("Initiating graceful shutdown");
        // Tasks that already exited dropped their receivers.
        let _ = self.shutdown_tx.send(());

        for task in self.tasks {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await {
                Ok(Ok(())) => info!(task = %task.name, "Task stopped gracefully"),
                Ok(Err(e)) => warn!(task = %task.name, error = %e, "Task failed"),
                Err(_) => warn!(task = %task.name, "Task shutdown timed out"),
            }
        }
        info!("Graceful shutdown complete");
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
