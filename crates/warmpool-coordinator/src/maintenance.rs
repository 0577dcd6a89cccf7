//! Periodic upkeep on a background task.
//!
//! The loop holds only a weak reference to its target, so dropping the
//! target ends the loop at the next tick. Dropping the loop handle does the
//! same.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Something that needs periodic upkeep.
pub trait Maintainable: Send + Sync + 'static {
    fn do_maintenance(&self) -> impl Future<Output = ()> + Send;
}

/// Handle to a running maintenance task.
pub struct MaintenanceLoop {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceLoop {
    /// Run `target.do_maintenance()` every `interval` until stopped.
    pub fn start<T: Maintainable>(target: &Arc<T>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintenance(Arc::downgrade(target), interval, shutdown_rx));
        info!(interval_ms = interval.as_millis() as u64, "maintenance loop started");
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop and wait for an in-progress cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
        info!("maintenance loop stopped");
    }
}

async fn run_maintenance<T: Maintainable>(
    target: Weak<T>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(target) = target.upgrade() else {
                    debug!("maintenance target dropped");
                    break;
                };
                target.do_maintenance().await;
            }
            _ = shutdown.changed() => {
                debug!("maintenance loop shutting down");
                break;
            }
        }
    }
}
