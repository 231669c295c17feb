//! Pending-operation store.
//!
//! The store is the only owner of queued mutations until the sync coordinator
//! confirms that the backend has durably accepted them.

use crate::outbox::repositories::{
    FileOperationRepository, InMemoryOperationRepository, PendingOperationRepository,
};
use crate::outbox::types::{OutboxError, SyncOperation};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Durable queue of operations awaiting backend acknowledgement
#[derive(Clone)]
pub struct PendingOperationStore {
    repository: Arc<dyn PendingOperationRepository>,
}

impl PendingOperationStore {
    pub fn new(repository: Arc<dyn PendingOperationRepository>) -> Self {
        Self { repository }
    }

    /// Store backed by one JSON document per operation under `data_dir`
    pub fn file(data_dir: PathBuf) -> Self {
        Self::new(Arc::new(FileOperationRepository::new(data_dir)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryOperationRepository::new()))
    }

    /// Persist an operation. The operation is queued only if this returns `Ok`.
    pub async fn enqueue(&self, operation: SyncOperation) -> Result<(), OutboxError> {
        self.repository.insert(&operation).await?;
        debug!(
            id = %operation.id,
            entity_type = %operation.entity_type,
            priority = operation.priority,
            "Queued {} operation",
            operation.operation_type.as_str()
        );
        Ok(())
    }

    /// Up to `limit` operations by priority descending, then oldest first.
    /// Nothing is removed.
    pub async fn dequeue_batch(&self, limit: usize) -> Result<Vec<SyncOperation>, OutboxError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.repository.peek_ordered(limit).await
    }

    /// Remove acknowledged operations. Unknown ids are ignored.
    pub async fn confirm(&self, ids: &[Uuid]) -> Result<usize, OutboxError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.repository.remove(ids).await?;
        info!("Confirmed {} of {} operations", removed, ids.len());
        Ok(removed)
    }

    pub async fn pending_count(&self) -> Result<usize, OutboxError> {
        self.repository.count().await
    }
}
