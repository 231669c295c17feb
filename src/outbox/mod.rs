pub mod repositories;
pub mod store;
pub mod types;

pub use repositories::{
	FileOperationRepository, InMemoryOperationRepository, PendingOperationRepository,
};
pub use store::PendingOperationStore;
pub use types::{EntityType, OperationType, OutboxError, SyncOperation, dispatch_order};
