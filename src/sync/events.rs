//! Status events of the sync coordinator.
//!
//! Every state transition is published two ways: on a broadcast channel that
//! subscribers read as a stream, and to handlers registered by callers. A new
//! subscriber first receives the current status, then every later transition.
//! Dropping a subscription has no effect on the coordinator.
//!
//! Handler failures, including panics, are logged and do not stop other
//! handlers from running.

use crate::sync::types::SyncStatus;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{error, warn};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Trait for receiving status transitions.
///
/// Handlers run on the coordinator's worker task and should return quickly.
pub trait SyncEventHandler: Send + Sync {
    /// Handle a status transition.
    fn handle(&self, status: &SyncStatus);

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Token returned by handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Publishes status transitions to subscribers and registered handlers.
pub struct StatusBroadcaster {
    current: Mutex<SyncStatus>,
    sender: broadcast::Sender<SyncStatus>,
    handlers: Mutex<Vec<(HandlerId, Arc<dyn SyncEventHandler>)>>,
    next_handler_id: AtomicU64,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            current: Mutex::new(SyncStatus::Idle),
            sender,
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.current.lock().clone()
    }

    /// Record and publish a transition.
    pub fn emit(&self, status: SyncStatus) {
        {
            let mut current = self.current.lock();
            *current = status.clone();
            // No receivers is fine
            let _ = self.sender.send(status.clone());
        }

        let handlers: Vec<Arc<dyn SyncEventHandler>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.handle(&status))).is_err() {
                error!("Status handler {} panicked", handler.name());
            }
        }
    }

    /// Subscribe to transitions, starting with the current status.
    pub fn subscribe(&self) -> StatusSubscription {
        let current = self.current.lock();
        StatusSubscription {
            initial: Some(current.clone()),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn SyncEventHandler>) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    /// Returns `false` if no handler was registered under `id`.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }
}

/// Stream of status transitions
pub struct StatusSubscription {
    initial: Option<SyncStatus>,
    receiver: broadcast::Receiver<SyncStatus>,
}

impl StatusSubscription {
    /// Next status, or `None` once the coordinator is gone.
    ///
    /// A subscriber that falls behind skips the statuses it missed.
    pub async fn recv(&mut self) -> Option<SyncStatus> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Status subscriber lagged, skipped {} transitions", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{SyncErrorKind, SyncFailure};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SyncStatus>>,
    }

    impl SyncEventHandler for Recorder {
        fn handle(&self, status: &SyncStatus) {
            self.seen.lock().push(status.clone());
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Panicking;

    impl SyncEventHandler for Panicking {
        fn handle(&self, _status: &SyncStatus) {
            panic!("handler bug");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    fn failure() -> SyncStatus {
        SyncStatus::Error(SyncFailure {
            kind: SyncErrorKind::Connectivity,
            message: "offline".to_string(),
            retryable: true,
        })
    }

    #[tokio::test]
    async fn test_subscription_starts_with_current_status() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.emit(SyncStatus::Syncing);

        let mut subscription = broadcaster.subscribe();
        broadcaster.emit(failure());
        broadcaster.emit(SyncStatus::Idle);

        assert_eq!(subscription.recv().await, Some(SyncStatus::Syncing));
        assert_eq!(subscription.recv().await, Some(failure()));
        assert_eq!(subscription.recv().await, Some(SyncStatus::Idle));
    }

    #[tokio::test]
    async fn test_handlers_survive_panics_and_unregister() {
        let broadcaster = StatusBroadcaster::new();
        let recorder = Arc::new(Recorder::default());
        broadcaster.register_handler(Arc::new(Panicking));
        let id = broadcaster.register_handler(recorder.clone());

        broadcaster.emit(SyncStatus::Syncing);
        assert!(broadcaster.unregister_handler(id));
        assert!(!broadcaster.unregister_handler(id));
        broadcaster.emit(SyncStatus::Idle);

        assert_eq!(*recorder.seen.lock(), vec![SyncStatus::Syncing]);
        assert_eq!(broadcaster.current(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_dropped_subscription_does_not_block_emit() {
        let broadcaster = StatusBroadcaster::new();
        let subscription = broadcaster.subscribe();
        drop(subscription);
        for _ in 0..(STATUS_CHANNEL_CAPACITY * 2) {
            broadcaster.emit(SyncStatus::Syncing);
        }
        assert_eq!(broadcaster.current(), SyncStatus::Syncing);
    }
}
