//! Persistence of the logical clock and the pull watermark.
//!
//! The coordinator restores its clock from here on startup so that counters keep
//! increasing across restarts, and saves after every queued operation and every
//! successful cycle.

use crate::sync::clock::LogicalClock;
use crate::sync::repositories::{
    FileSyncStateRepository, InMemorySyncStateRepository, PersistedSyncState, StateError,
    SyncStateRepository,
};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Service for saving and restoring coordinator state.
#[derive(Clone)]
pub struct SyncStatePersistence {
    repository: Arc<dyn SyncStateRepository>,
}

impl SyncStatePersistence {
    pub fn new(repository: Arc<dyn SyncStateRepository>) -> Self {
        Self { repository }
    }

    /// Persist to `sync_state.json` under `data_dir`.
    pub fn file(data_dir: PathBuf) -> Self {
        Self::new(Arc::new(FileSyncStateRepository::new(data_dir)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySyncStateRepository::new()))
    }

    /// Restore persisted state, or start a fresh clock for `device_id`.
    ///
    /// A persisted device id takes precedence over the configured one.
    pub async fn restore_or_init(&self, device_id: &str) -> Result<PersistedSyncState, StateError> {
        match self.repository.load().await? {
            Some(state) => {
                if state.clock.device_id() != device_id {
                    info!(
                        "Keeping persisted device id {} over configured {}",
                        state.clock.device_id(),
                        device_id
                    );
                }
                Ok(state)
            }
            None => {
                info!("No persisted sync state, starting clock for {}", device_id);
                Ok(PersistedSyncState {
                    clock: LogicalClock::new(device_id),
                    last_sync: None,
                })
            }
        }
    }

    pub async fn save(
        &self,
        clock: &LogicalClock,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<(), StateError> {
        self.repository
            .save(&PersistedSyncState {
                clock: clock.clone(),
                last_sync,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_keeps_persisted_device_id() {
        let persistence = SyncStatePersistence::in_memory();
        let fresh = persistence.restore_or_init("device-a").await.unwrap();
        assert_eq!(fresh.clock.counter(), 0);
        assert!(fresh.last_sync.is_none());

        let mut clock = fresh.clock;
        clock.tick();
        persistence.save(&clock, Some(Utc::now())).await.unwrap();

        let restored = persistence.restore_or_init("device-b").await.unwrap();
        assert_eq!(restored.clock.device_id(), "device-a");
        assert_eq!(restored.clock.counter(), 1);
        assert!(restored.last_sync.is_some());
    }
}
