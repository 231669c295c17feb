use crate::sync::conflict::{ConflictResolver, RemoteChange, Resolution};
use crate::sync::local_store::{LocalEntityStore, LocalStoreError};
use std::sync::Arc;
use tracing::debug;

/// Applies incoming changes to a local entity store through the conflict rule
#[derive(Clone)]
pub struct ChangeApplier {
    store: Arc<dyn LocalEntityStore>,
}

impl ChangeApplier {
    pub fn new(store: Arc<dyn LocalEntityStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, change: &RemoteChange) -> Result<Resolution, LocalStoreError> {
        let key = change.key();
        let local = self.store.version_of(&key).await?;
        let resolution = ConflictResolver::resolve(local.as_ref(), &change.stamp());

        match resolution {
            Resolution::AcceptIncoming => {
                self.store.apply(change).await?;
                debug!(
                    "Applied {} {} at version {} from {}",
                    change.entity_type, change.entity_id, change.version, change.device_id
                );
            }
            Resolution::KeepLocal => {
                debug!(
                    "Kept local {} {} over version {} from {}",
                    change.entity_type, change.entity_id, change.version, change.device_id
                );
            }
        }

        Ok(resolution)
    }
}
