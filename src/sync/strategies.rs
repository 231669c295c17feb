use crate::backend::OperationUploader;
use crate::broker::{BrokerClient, DeliveryState, WireRecord};
use crate::outbox::SyncOperation;
use crate::sync::clock::ClockStamp;
use crate::sync::types::SyncError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of handing a batch to an upload path
#[derive(Debug, Default)]
pub struct UploadOutcome {
	/// Ids durably acknowledged, safe to confirm.
	pub acknowledged: Vec<Uuid>,
	/// Set when the batch was not fully acknowledged because of an error.
	pub failure: Option<SyncError>,
}

/// Trait for the paths that move pending operations to the backend
#[async_trait::async_trait]
pub trait UploadStrategy: Send + Sync {
	/// Upload `batch` in order. Operations without a queued version fall back to `stamp`.
	async fn upload(&self, batch: &[SyncOperation], stamp: &ClockStamp) -> UploadOutcome;

	/// Get the name of this strategy
	fn name(&self) -> &'static str;
}

/// Publishes each operation to the broker in dequeue order
pub struct BrokerUpload {
	client: BrokerClient,
}

impl BrokerUpload {
	pub fn new(client: BrokerClient) -> Self {
		Self { client }
	}
}

#[async_trait::async_trait]
impl UploadStrategy for BrokerUpload {
	async fn upload(&self, batch: &[SyncOperation], stamp: &ClockStamp) -> UploadOutcome {
		let mut outcome = UploadOutcome::default();
		if batch.is_empty() {
			return outcome;
		}

		if self.client.state() != DeliveryState::Connected {
			if let Err(e) = self.client.connect().await {
				warn!("Broker unavailable for upload: {}", e);
				outcome.failure = Some(e.into());
				return outcome;
			}
		}

		let region = self.client.config().region.clone();
		for operation in batch {
			let record = WireRecord::new(
				operation.clone(),
				region.clone(),
				operation.version.unwrap_or(stamp.counter),
				stamp.device_id.clone(),
			);
			match self.client.publish(&record).await {
				Ok(()) => outcome.acknowledged.push(operation.id),
				Err(e) => {
					// Later operations wait for the next cycle to keep dequeue order
					warn!(
						"Stopping upload after {} of {} operations: {}",
						outcome.acknowledged.len(),
						batch.len(),
						e
					);
					outcome.failure = Some(e.into());
					break;
				}
			}
		}

		debug!("Published {} operations", outcome.acknowledged.len());
		outcome
	}

	fn name(&self) -> &'static str {
		"broker"
	}
}

/// Uploads the whole batch with one `POST /sync`
pub struct DirectUpload {
	uploader: Arc<dyn OperationUploader>,
	timeout: Duration,
}

impl DirectUpload {
	pub fn new(uploader: Arc<dyn OperationUploader>, timeout: Duration) -> Self {
		Self { uploader, timeout }
	}
}

#[async_trait::async_trait]
impl UploadStrategy for DirectUpload {
	async fn upload(&self, batch: &[SyncOperation], stamp: &ClockStamp) -> UploadOutcome {
		let mut outcome = UploadOutcome::default();
		if batch.is_empty() {
			return outcome;
		}

		match tokio::time::timeout(self.timeout, self.uploader.upload(batch, stamp)).await {
			Ok(Ok(accepted)) => {
				let sent: HashSet<Uuid> = batch.iter().map(|op| op.id).collect();
				outcome.acknowledged = accepted.into_iter().filter(|id| sent.contains(id)).collect();
				if outcome.acknowledged.len() < batch.len() {
					info!(
						"Backend accepted {} of {} operations, the rest stay pending",
						outcome.acknowledged.len(),
						batch.len()
					);
				}
			}
			Ok(Err(e)) => outcome.failure = Some(e.into()),
			Err(_) => outcome.failure = Some(SyncError::Timeout("upload", self.timeout)),
		}
		outcome
	}

	fn name(&self) -> &'static str {
		"direct"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::BackendError;
	use crate::broker::codec::HEADER_VERSION;
	use crate::broker::types::HeaderValue;
	use crate::broker::{
		BrokerConfig, BrokerConnector, BrokerError, BrokerSession, MemoryBroker, Topology,
	};
	use crate::outbox::{EntityType, OperationType};

	fn make_operation(priority: i32) -> SyncOperation {
		SyncOperation::new(
			OperationType::Create,
			EntityType::Species,
			format!("sp-{}", priority),
			Vec::new(),
			priority,
		)
	}

	struct AcceptSome {
		accept: usize,
		extra: Uuid,
	}

	#[async_trait::async_trait]
	impl OperationUploader for AcceptSome {
		async fn upload(
			&self,
			operations: &[SyncOperation],
			_stamp: &ClockStamp,
		) -> Result<Vec<Uuid>, BackendError> {
			let mut ids: Vec<Uuid> = operations.iter().take(self.accept).map(|op| op.id).collect();
			ids.push(self.extra);
			Ok(ids)
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_broker_upload_keeps_partial_acknowledgements() {
		let broker = MemoryBroker::new();
		let client = BrokerClient::new(BrokerConfig::default(), Arc::new(broker.connector()));
		let strategy = BrokerUpload::new(client.clone());
		let batch = vec![make_operation(3), make_operation(2), make_operation(1)];

		client.connect().await.unwrap();
		let first = strategy.upload(&batch[..1], &ClockStamp::new(1, "device-a")).await;
		assert_eq!(first.acknowledged, vec![batch[0].id]);

		broker.stall_publishes(true);
		let rest = strategy.upload(&batch[1..], &ClockStamp::new(1, "device-a")).await;
		assert!(rest.acknowledged.is_empty());
		assert!(matches!(rest.failure, Some(SyncError::Broker(_))));
		assert_eq!(broker.queue_depth("sync_tasks"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_broker_upload_connects_on_demand() {
		let broker = MemoryBroker::new();
		let client = BrokerClient::new(BrokerConfig::default(), Arc::new(broker.connector()));
		let strategy = BrokerUpload::new(client);
		let batch = vec![make_operation(5), make_operation(1)];

		let outcome = strategy.upload(&batch, &ClockStamp::new(7, "device-a")).await;
		assert!(outcome.failure.is_none());
		assert_eq!(outcome.acknowledged, vec![batch[0].id, batch[1].id]);

		let ids: Vec<String> = broker
			.ready_messages("sync_tasks")
			.into_iter()
			.map(|m| m.message_id)
			.collect();
		assert_eq!(ids, vec![batch[0].id.to_string(), batch[1].id.to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_broker_upload_offline_is_connectivity_error() {
		let broker = MemoryBroker::new();
		broker.set_available(false);
		let client = BrokerClient::new(BrokerConfig::default(), Arc::new(broker.connector()));
		let outcome = BrokerUpload::new(client)
			.upload(&[make_operation(1)], &ClockStamp::new(1, "device-a"))
			.await;
		assert!(matches!(outcome.failure, Some(SyncError::Connectivity)));
	}

	struct HangingConnector;

	#[async_trait::async_trait]
	impl BrokerConnector for HangingConnector {
		async fn connect(&self, _topology: &Topology) -> Result<Arc<dyn BrokerSession>, BrokerError> {
			std::future::pending().await
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_broker_upload_gives_up_on_stuck_connect() {
		let client = BrokerClient::new(BrokerConfig::default(), Arc::new(HangingConnector));
		let outcome = BrokerUpload::new(client)
			.upload(&[make_operation(1)], &ClockStamp::new(1, "device-a"))
			.await;
		assert!(outcome.acknowledged.is_empty());
		assert!(matches!(
			outcome.failure,
			Some(SyncError::Broker(BrokerError::Timeout(_)))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_broker_upload_keeps_each_operation_version() {
		let broker = MemoryBroker::new();
		let client = BrokerClient::new(BrokerConfig::default(), Arc::new(broker.connector()));
		let batch = vec![
			make_operation(2).with_version(3),
			make_operation(1).with_version(4),
			make_operation(0),
		];

		let outcome = BrokerUpload::new(client)
			.upload(&batch, &ClockStamp::new(9, "device-a"))
			.await;
		assert!(outcome.failure.is_none());

		let versions: Vec<Option<HeaderValue>> = broker
			.ready_messages("sync_tasks")
			.into_iter()
			.map(|m| m.headers.get(HEADER_VERSION).cloned())
			.collect();
		assert_eq!(
			versions,
			vec![
				Some(HeaderValue::Int(3)),
				Some(HeaderValue::Int(4)),
				Some(HeaderValue::Int(9)),
			]
		);
	}

	#[tokio::test]
	async fn test_direct_upload_confirms_only_sent_ids() {
		let extra = Uuid::new_v4();
		let strategy = DirectUpload::new(
			Arc::new(AcceptSome { accept: 1, extra }),
			Duration::from_secs(5),
		);
		let batch = vec![make_operation(2), make_operation(1)];

		let outcome = strategy.upload(&batch, &ClockStamp::new(1, "device-a")).await;
		assert_eq!(outcome.acknowledged, vec![batch[0].id]);
		assert!(outcome.failure.is_none());
	}
}
