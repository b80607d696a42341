//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal does not abort a running backup. It marks the watched backup
//! records as DELETING, which the engine notices at its next chunk and
//! answers by removing every object it wrote.

use crate::model::{BackupStatus, SharedBackup};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast shutdown to all subscribers.
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("No task is listening for shutdown: {}", e);
        }
    }

    /// Wait for SIGTERM or SIGINT, then broadcast shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), cancelling backup..."),
            _ = terminate => info!("Received SIGTERM, cancelling backup..."),
        }

        self.trigger();
    }

    /// Mark `backup` as DELETING once shutdown is broadcast.
    ///
    /// The returned task ends after marking, or when the coordinator is
    /// dropped without a shutdown.
    pub fn cancel_on_shutdown(&self, backup: SharedBackup) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            if rx.recv().await.is_ok() {
                let mut record = backup.write().await;
                if record.status == BackupStatus::Creating {
                    info!("Marking backup {} for deletion", record.id);
                    record.status = BackupStatus::Deleting;
                }
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
