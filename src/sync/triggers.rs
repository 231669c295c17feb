//! Sources of sync cycles outside the coordinator.
//!
//! Connectivity is observed through `ConnectivityMonitor`; the host's background
//! task facility is reached through `BackgroundScheduler`. Both are traits so the
//! host can wire in whatever platform mechanism it has.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Reachability of the backend as seen by the host
pub trait ConnectivityMonitor: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Receiver that changes whenever reachability changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flag set by the host, e.g. from network callbacks
pub struct ConnectivityState {
    sender: watch::Sender<bool>,
}

impl ConnectivityState {
    pub fn new(reachable: bool) -> Self {
        let (sender, _) = watch::channel(reachable);
        Self { sender }
    }

    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == reachable {
                return false;
            }
            *current = reachable;
            true
        });
        if changed {
            info!("Connectivity {}", if reachable { "restored" } else { "lost" });
        }
    }
}

impl ConnectivityMonitor for ConnectivityState {
    fn is_reachable(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Recurring wake-ups requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundTask {
    PeriodicSync,
    CoarseRefresh,
}

/// Host OS task scheduler
pub trait BackgroundScheduler: Send + Sync {
    /// Ask for an out-of-band sync as soon as the host allows.
    fn request_immediate_sync(&self);

    fn schedule_recurring(&self, task: BackgroundTask, interval: Duration);
}

/// Scheduler for hosts without a background facility; only logs requests.
#[derive(Debug, Default)]
pub struct LoggingScheduler;

impl BackgroundScheduler for LoggingScheduler {
    fn request_immediate_sync(&self) {
        info!("Immediate background sync requested");
    }

    fn schedule_recurring(&self, task: BackgroundTask, interval: Duration) {
        info!("Recurring {:?} every {:?}", task, interval);
    }
}
