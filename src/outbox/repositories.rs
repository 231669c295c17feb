use crate::outbox::types::{OutboxError, SyncOperation, dispatch_order};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const OPERATION_PREFIX: &str = "op_";
const OPERATION_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".json.tmp";

/// Repository for operations awaiting backend acknowledgement, keyed by operation id
#[async_trait::async_trait]
pub trait PendingOperationRepository: Send + Sync {
	/// Durably record an operation. Returning `Ok` means the write is on disk.
	async fn insert(&self, operation: &SyncOperation) -> Result<(), OutboxError>;
	/// Return up to `limit` operations in dispatch order without removing them.
	async fn peek_ordered(&self, limit: usize) -> Result<Vec<SyncOperation>, OutboxError>;
	/// Remove the given ids, ignoring any that are not present. Returns how many were removed.
	async fn remove(&self, ids: &[Uuid]) -> Result<usize, OutboxError>;
	async fn count(&self) -> Result<usize, OutboxError>;
}

/// File-based implementation of PendingOperationRepository.
///
/// Each operation lives in its own `op_<uuid>.json` document. Writes go to a
/// temporary file that is fsynced and then renamed into place, so a document is
/// either fully present or absent.
pub struct FileOperationRepository {
	data_dir: PathBuf,
}

impl FileOperationRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn operation_filename(&self, id: &Uuid) -> PathBuf {
		self.data_dir
			.join(format!("{}{}{}", OPERATION_PREFIX, id, OPERATION_SUFFIX))
	}

	fn temp_filename(&self, id: &Uuid) -> PathBuf {
		self.data_dir
			.join(format!("{}{}{}", OPERATION_PREFIX, id, TEMP_SUFFIX))
	}

	fn is_operation_file(path: &Path) -> bool {
		path.file_name()
			.and_then(|f| f.to_str())
			.map(|name| name.starts_with(OPERATION_PREFIX) && name.ends_with(OPERATION_SUFFIX))
			.unwrap_or(false)
	}

	async fn load_all(&self) -> Result<Vec<SyncOperation>, OutboxError> {
		let read_err = |source| OutboxError::Read {
			path: self.data_dir.clone(),
			source,
		};

		let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(read_err(e)),
		};

		let mut operations = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
			let path = entry.path();
			if !Self::is_operation_file(&path) {
				continue;
			}

			let content = match tokio::fs::read(&path).await {
				Ok(content) => content,
				// Confirmed concurrently
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
				Err(e) => {
					return Err(OutboxError::Read { path, source: e });
				}
			};

			match serde_json::from_slice::<SyncOperation>(&content) {
				Ok(operation) => operations.push(operation),
				Err(e) => {
					warn!("Skipping unreadable pending operation {:?}: {}", path, e);
				}
			}
		}

		Ok(operations)
	}
}

#[async_trait::async_trait]
impl PendingOperationRepository for FileOperationRepository {
	async fn insert(&self, operation: &SyncOperation) -> Result<(), OutboxError> {
		let persist_err = |source| OutboxError::Persist {
			id: operation.id,
			source,
		};

		let content = serde_json::to_vec(operation)?;

		tokio::fs::create_dir_all(&self.data_dir)
			.await
			.map_err(persist_err)?;

		let temp_path = self.temp_filename(&operation.id);
		let mut file = tokio::fs::File::create(&temp_path)
			.await
			.map_err(persist_err)?;
		file.write_all(&content).await.map_err(persist_err)?;
		file.sync_all().await.map_err(persist_err)?;
		drop(file);

		tokio::fs::rename(&temp_path, self.operation_filename(&operation.id))
			.await
			.map_err(persist_err)?;

		debug!("Persisted pending operation {}", operation.id);
		Ok(())
	}

	async fn peek_ordered(&self, limit: usize) -> Result<Vec<SyncOperation>, OutboxError> {
		let mut operations = self.load_all().await?;
		operations.sort_by(dispatch_order);
		operations.truncate(limit);
		Ok(operations)
	}

	async fn remove(&self, ids: &[Uuid]) -> Result<usize, OutboxError> {
		let mut removed = 0;
		for id in ids {
			match tokio::fs::remove_file(self.operation_filename(id)).await {
				Ok(()) => removed += 1,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
					debug!("Operation {} already confirmed", id);
				}
				Err(e) => return Err(OutboxError::Remove { id: *id, source: e }),
			}
		}
		Ok(removed)
	}

	async fn count(&self) -> Result<usize, OutboxError> {
		Ok(self.load_all().await?.len())
	}
}

/// In-memory implementation of PendingOperationRepository
#[derive(Default)]
pub struct InMemoryOperationRepository {
	operations: Mutex<HashMap<Uuid, SyncOperation>>,
}

impl InMemoryOperationRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl PendingOperationRepository for InMemoryOperationRepository {
	async fn insert(&self, operation: &SyncOperation) -> Result<(), OutboxError> {
		self.operations
			.lock()
			.insert(operation.id, operation.clone());
		Ok(())
	}

	async fn peek_ordered(&self, limit: usize) -> Result<Vec<SyncOperation>, OutboxError> {
		let mut operations: Vec<SyncOperation> = self.operations.lock().values().cloned().collect();
		operations.sort_by(dispatch_order);
		operations.truncate(limit);
		Ok(operations)
	}

	async fn remove(&self, ids: &[Uuid]) -> Result<usize, OutboxError> {
		let mut guard = self.operations.lock();
		Ok(ids.iter().filter(|id| guard.remove(id).is_some()).count())
	}

	async fn count(&self) -> Result<usize, OutboxError> {
		Ok(self.operations.lock().len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::outbox::types::{EntityType, OperationType};

	fn make_operation(priority: i32) -> SyncOperation {
		SyncOperation::new(
			OperationType::Create,
			EntityType::Species,
			"sp-1",
			b"{\"name\":\"heron\"}".to_vec(),
			priority,
		)
	}

	#[tokio::test]
	async fn test_file_repository_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let operation = make_operation(2);

		let repo = FileOperationRepository::new(dir.path().to_path_buf());
		repo.insert(&operation).await.unwrap();
		drop(repo);

		let reopened = FileOperationRepository::new(dir.path().to_path_buf());
		let loaded = reopened.peek_ordered(10).await.unwrap();
		assert_eq!(loaded, vec![operation]);
		assert_eq!(reopened.count().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_file_repository_remove_ignores_unknown_ids() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileOperationRepository::new(dir.path().to_path_buf());
		let operation = make_operation(0);
		repo.insert(&operation).await.unwrap();

		let removed = repo.remove(&[operation.id, Uuid::new_v4()]).await.unwrap();
		assert_eq!(removed, 1);
		assert_eq!(repo.remove(&[operation.id]).await.unwrap(), 0);
		assert_eq!(repo.count().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_file_repository_skips_corrupt_documents() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileOperationRepository::new(dir.path().to_path_buf());
		let operation = make_operation(1);
		repo.insert(&operation).await.unwrap();

		let corrupt = dir.path().join(format!("op_{}.json", Uuid::new_v4()));
		std::fs::write(&corrupt, b"not json").unwrap();
		std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

		let loaded = repo.peek_ordered(10).await.unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].id, operation.id);
		assert!(corrupt.exists());
	}

	#[tokio::test]
	async fn test_file_repository_missing_directory_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileOperationRepository::new(dir.path().join("never-created"));
		assert!(repo.peek_ordered(5).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_file_repository_insert_fails_when_path_is_a_file() {
		let dir = tempfile::tempdir().unwrap();
		let blocker = dir.path().join("blocker");
		std::fs::write(&blocker, b"").unwrap();

		let repo = FileOperationRepository::new(blocker);
		let operation = make_operation(0);
		let err = repo.insert(&operation).await.unwrap_err();
		assert!(matches!(err, OutboxError::Persist { id, .. } if id == operation.id));
	}

	#[tokio::test]
	async fn test_in_memory_repository_orders_and_truncates() {
		let repo = InMemoryOperationRepository::new();
		for priority in [1, 5, 3] {
			repo.insert(&make_operation(priority)).await.unwrap();
		}

		let batch = repo.peek_ordered(2).await.unwrap();
		let priorities: Vec<i32> = batch.iter().map(|op| op.priority).collect();
		assert_eq!(priorities, vec![5, 3]);
		assert_eq!(repo.count().await.unwrap(), 3);
	}
}
