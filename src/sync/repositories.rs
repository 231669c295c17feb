use crate::sync::clock::LogicalClock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

const STATE_FILENAME: &str = "sync_state.json";

/// Coordinator state that survives restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSyncState {
	pub clock: LogicalClock,
	/// Watermark of the last successful pull.
	pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
	#[error("Failed to write sync state to {path:?}: {source}")]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Failed to read sync state from {path:?}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Corrupt sync state: {0}")]
	Corrupt(#[from] serde_json::Error),
}

/// Repository for the coordinator's clock and watermark
#[async_trait::async_trait]
pub trait SyncStateRepository: Send + Sync {
	async fn save(&self, state: &PersistedSyncState) -> Result<(), StateError>;
	async fn load(&self) -> Result<Option<PersistedSyncState>, StateError>;
}

/// File-based implementation of SyncStateRepository
pub struct FileSyncStateRepository {
	data_dir: PathBuf,
}

impl FileSyncStateRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn state_filename(&self) -> PathBuf {
		self.data_dir.join(STATE_FILENAME)
	}
}

#[async_trait::async_trait]
impl SyncStateRepository for FileSyncStateRepository {
	async fn save(&self, state: &PersistedSyncState) -> Result<(), StateError> {
		let filename = self.state_filename();
		let write_err = |source| StateError::Write {
			path: filename.clone(),
			source,
		};
		let content = serde_json::to_vec_pretty(state)?;

		tokio::fs::create_dir_all(&self.data_dir)
			.await
			.map_err(write_err)?;

		// Replace atomically so a crash leaves either the old or the new state
		let temp_filename = self.data_dir.join(format!("{}.tmp", STATE_FILENAME));
		let mut file = tokio::fs::File::create(&temp_filename)
			.await
			.map_err(write_err)?;
		file.write_all(&content).await.map_err(write_err)?;
		file.sync_all().await.map_err(write_err)?;
		drop(file);
		tokio::fs::rename(&temp_filename, &filename)
			.await
			.map_err(write_err)?;

		info!(
			"Saved sync state to {:?} at clock {}",
			filename,
			state.clock.counter()
		);
		Ok(())
	}

	async fn load(&self) -> Result<Option<PersistedSyncState>, StateError> {
		let filename = self.state_filename();
		let content = match tokio::fs::read(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => {
				return Err(StateError::Read {
					path: filename,
					source: e,
				});
			}
		};

		let state: PersistedSyncState = serde_json::from_slice(&content)?;
		info!(
			"Loaded sync state from {:?} at clock {}",
			filename,
			state.clock.counter()
		);
		Ok(Some(state))
	}
}

/// In-memory implementation of SyncStateRepository
#[derive(Default)]
pub struct InMemorySyncStateRepository {
	state: Mutex<Option<PersistedSyncState>>,
}

impl InMemorySyncStateRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl SyncStateRepository for InMemorySyncStateRepository {
	async fn save(&self, state: &PersistedSyncState) -> Result<(), StateError> {
		*self.state.lock() = Some(state.clone());
		Ok(())
	}

	async fn load(&self) -> Result<Option<PersistedSyncState>, StateError> {
		Ok(self.state.lock().clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_file_state_round_trip_and_missing() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileSyncStateRepository::new(dir.path().join("state"));
		assert!(repo.load().await.unwrap().is_none());

		let mut clock = LogicalClock::new("device-a");
		clock.tick();
		clock.tick();
		let state = PersistedSyncState {
			clock,
			last_sync: Some(Utc::now()),
		};
		repo.save(&state).await.unwrap();

		assert_eq!(repo.load().await.unwrap(), Some(state));
	}

	#[tokio::test]
	async fn test_corrupt_state_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(STATE_FILENAME), b"{").unwrap();
		let repo = FileSyncStateRepository::new(dir.path().to_path_buf());
		assert!(matches!(repo.load().await, Err(StateError::Corrupt(_))));
	}
}
