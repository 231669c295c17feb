//! Local entity storage seam.
//!
//! The relational schema of the host application is outside this crate; the
//! sync pipeline only needs the current version stamp of an entity and a way to
//! write a winning change.

use crate::outbox::{EntityType, OperationType, SyncOperation};
use crate::sync::clock::ClockStamp;
use crate::sync::conflict::RemoteChange;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("Local store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write {entity_type} {entity_id}: {message}")]
    Write {
        entity_type: EntityType,
        entity_id: String,
        message: String,
    },
}

/// Durable storage for entities on this device or on the receiving side
#[async_trait::async_trait]
pub trait LocalEntityStore: Send + Sync {
    /// Version stamp of the stored entity, including deleted ones.
    async fn version_of(&self, key: &EntityKey) -> Result<Option<ClockStamp>, LocalStoreError>;

    /// Write a change that won conflict resolution.
    async fn apply(&self, change: &RemoteChange) -> Result<(), LocalStoreError>;

    /// Record a mutation made on this device under the stamp it was queued with.
    async fn record_local(
        &self,
        operation: &SyncOperation,
        stamp: &ClockStamp,
    ) -> Result<(), LocalStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntity {
    pub version: ClockStamp,
    /// `None` marks a tombstone.
    pub data: Option<Vec<u8>>,
}

/// In-memory entity store. Deletes leave a tombstone so older writes cannot
/// resurrect the entity.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<EntityKey, StoredEntity>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<StoredEntity> {
        self.entities.read().get(key).cloned()
    }

    pub fn insert(&self, key: EntityKey, entity: StoredEntity) {
        self.entities.write().insert(key, entity);
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl LocalEntityStore for InMemoryEntityStore {
    async fn version_of(&self, key: &EntityKey) -> Result<Option<ClockStamp>, LocalStoreError> {
        Ok(self.entities.read().get(key).map(|e| e.version.clone()))
    }

    async fn apply(&self, change: &RemoteChange) -> Result<(), LocalStoreError> {
        let data = if change.is_delete() {
            None
        } else {
            Some(change.data.clone())
        };
        self.entities.write().insert(
            change.key(),
            StoredEntity {
                version: change.stamp(),
                data,
            },
        );
        Ok(())
    }

    async fn record_local(
        &self,
        operation: &SyncOperation,
        stamp: &ClockStamp,
    ) -> Result<(), LocalStoreError> {
        let data = match operation.operation_type {
            OperationType::Delete => None,
            _ => Some(operation.payload.clone()),
        };
        self.entities.write().insert(
            EntityKey::new(operation.entity_type, operation.entity_id.clone()),
            StoredEntity {
                version: stamp.clone(),
                data,
            },
        );
        Ok(())
    }
}
