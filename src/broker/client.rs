use crate::broker::circuit_breaker::{
	CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState,
};
use crate::broker::codec::{self, OutgoingMessage};
use crate::broker::consumer::{
	BatchConfig, BatchConsumer, ConsumeExit, FlushReport, RecordHandler, stop_requested,
};
use crate::broker::transport::{BrokerConnector, BrokerSession, Topology};
use crate::broker::types::{BrokerError, DeliveryState, WireRecord};
use crate::metrics;
use backoff::ExponentialBackoffBuilder;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	pub topology: Topology,
	/// Region segment of every routing key.
	pub region: String,
	/// Must be at least `batch.max_batch_size`, deliveries stay unacked until flushed.
	pub prefetch: u16,
	pub consumer_tag: String,
	/// Upper bound for opening a connection and declaring topology.
	pub connect_timeout: Duration,
	/// Upper bound for one publish including its confirm and any wait for the channel.
	pub publish_timeout: Duration,
	pub reconnect_delay: Duration,
	/// First retry delay after a negative confirm.
	pub nack_retry_interval: Duration,
	pub breaker: CircuitBreakerConfig,
	pub batch: BatchConfig,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			topology: Topology::new("wildlife_sync", "sync_tasks")
				.with_dead_letter("wildlife_sync_dlx"),
			region: "default".to_string(),
			prefetch: 200,
			consumer_tag: "sync-service-consumer".to_string(),
			connect_timeout: Duration::from_secs(10),
			publish_timeout: Duration::from_secs(10),
			reconnect_delay: Duration::from_secs(5),
			nack_retry_interval: Duration::from_millis(200),
			breaker: CircuitBreakerConfig::default(),
			batch: BatchConfig::default(),
		}
	}
}

/// Owned handle to a broker connection.
///
/// Clones share one connection. The reconnection monitor runs while any clone
/// is alive and stops once the last one is dropped or [`BrokerClient::close`]
/// is called.
#[derive(Clone)]
pub struct BrokerClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	config: BrokerConfig,
	connector: Arc<dyn BrokerConnector>,
	session: RwLock<Option<Arc<dyn BrokerSession>>>,
	connect_lock: tokio::sync::Mutex<()>,
	publish_lock: tokio::sync::Mutex<()>,
	state_tx: watch::Sender<DeliveryState>,
	breaker: CircuitBreaker,
	monitor: Mutex<Option<JoinHandle<()>>>,
	consumers: Mutex<Vec<AbortHandle>>,
	closed: AtomicBool,
}

impl BrokerClient {
	pub fn new(config: BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
		let (state_tx, _) = watch::channel(DeliveryState::Disconnected);
		let breaker = CircuitBreaker::new("broker-publish", config.breaker.clone());
		Self {
			inner: Arc::new(ClientInner {
				config,
				connector,
				session: RwLock::new(None),
				connect_lock: tokio::sync::Mutex::new(()),
				publish_lock: tokio::sync::Mutex::new(()),
				state_tx,
				breaker,
				monitor: Mutex::new(None),
				consumers: Mutex::new(Vec::new()),
				closed: AtomicBool::new(false),
			}),
		}
	}

	pub fn config(&self) -> &BrokerConfig {
		&self.inner.config
	}

	/// Connect and declare topology. No-op when already connected.
	pub async fn connect(&self) -> Result<(), BrokerError> {
		self.inner.establish().await
	}

	pub fn state(&self) -> DeliveryState {
		*self.inner.state_tx.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<DeliveryState> {
		self.inner.state_tx.subscribe()
	}

	pub fn circuit_state(&self) -> CircuitState {
		self.inner.breaker.state()
	}

	/// Publish one record and wait for the broker's confirm.
	///
	/// Fails fast with [`BrokerError::CircuitOpen`] while the breaker is open.
	pub async fn publish(&self, record: &WireRecord) -> Result<(), BrokerError> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::Closed);
		}
		let message = codec::encode(record)?;

		match self
			.inner
			.breaker
			.call(self.inner.publish_confirmed(&message))
			.await
		{
			Ok(()) => {
				metrics::record_publish("success");
				debug!(
					id = %record.operation.id,
					routing_key = %message.routing_key,
					"Published record"
				);
				Ok(())
			}
			Err(CircuitError::Open { retry_after }) => {
				metrics::record_publish("circuit_open");
				Err(BrokerError::CircuitOpen { retry_after })
			}
			Err(CircuitError::Inner(e)) => {
				metrics::record_publish("error");
				warn!(id = %record.operation.id, "Publish failed: {}", e);
				Err(e)
			}
		}
	}

	/// Start consuming on a dedicated task. The consumer resubscribes after
	/// every reconnection until the handle is shut down or the client closes.
	pub fn consume(&self, handler: Arc<dyn RecordHandler>) -> ConsumerHandle {
		self.consume_with_reports(handler, None)
	}

	pub fn consume_with_reports(
		&self,
		handler: Arc<dyn RecordHandler>,
		reports: Option<mpsc::UnboundedSender<FlushReport>>,
	) -> ConsumerHandle {
		let mut consumer = BatchConsumer::new(self.inner.config.batch.clone(), handler);
		if let Some(reports) = reports {
			consumer = consumer.with_reports(reports);
		}

		let (stop_tx, stop_rx) = watch::channel(false);
		let task = tokio::spawn(consume_loop(Arc::downgrade(&self.inner), consumer, stop_rx));
		self.inner.consumers.lock().push(task.abort_handle());

		ConsumerHandle {
			stop: stop_tx,
			task,
		}
	}

	/// Release the connection and stop reconnecting.
	pub async fn close(&self) -> Result<(), BrokerError> {
		let _guard = self.inner.connect_lock.lock().await;
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		self.inner.state_tx.send_replace(DeliveryState::Closed);
		if let Some(monitor) = self.inner.monitor.lock().take() {
			monitor.abort();
		}
		let session = self.inner.session.write().take();
		if let Some(session) = session {
			session.close().await?;
		}
		info!("Broker client closed");
		Ok(())
	}
}

impl ClientInner {
	async fn establish(self: &Arc<Self>) -> Result<(), BrokerError> {
		let _guard = self.connect_lock.lock().await;
		if self.closed.load(Ordering::SeqCst) {
			return Err(BrokerError::Closed);
		}
		let already_open = self
			.session
			.read()
			.as_ref()
			.map(|session| session.is_open())
			.unwrap_or(false);
		if already_open {
			return Ok(());
		}

		self.state_tx.send_replace(DeliveryState::Connecting);
		let timeout = self.config.connect_timeout;
		let connected = tokio::time::timeout(timeout, self.connector.connect(&self.config.topology))
			.await
			.unwrap_or(Err(BrokerError::Timeout(timeout)));
		match connected {
			Ok(session) => {
				*self.session.write() = Some(session.clone());
				self.state_tx.send_replace(DeliveryState::Connected);
				let monitor = tokio::spawn(monitor_connection(Arc::downgrade(self), session));
				// The replaced monitor, if any, belongs to a dead session and exits on its own
				let _ = self.monitor.lock().replace(monitor);
				info!(
					"Connected to broker, exchange {}",
					self.config.topology.exchange
				);
				Ok(())
			}
			Err(e) => {
				self.state_tx.send_replace(DeliveryState::Disconnected);
				Err(e)
			}
		}
	}

	fn connected_session(&self) -> Option<Arc<dyn BrokerSession>> {
		if *self.state_tx.borrow() != DeliveryState::Connected {
			return None;
		}
		self.session.read().clone()
	}

	/// Publish on the shared channel, retrying negative confirms, failing as
	/// soon as the connection leaves the Connected state. The timeout also
	/// covers waiting for the channel behind other publishes.
	async fn publish_confirmed(&self, message: &OutgoingMessage) -> Result<(), BrokerError> {
		let timeout = self.config.publish_timeout;
		let mut state_rx = self.state_tx.subscribe();
		tokio::select! {
			result = tokio::time::timeout(timeout, self.publish_serialized(message, timeout)) => {
				result.map_err(|_| BrokerError::Timeout(timeout))?
			}
			_ = left_connected(&mut state_rx) => Err(BrokerError::Disconnected),
		}
	}

	async fn publish_serialized(
		&self,
		message: &OutgoingMessage,
		timeout: Duration,
	) -> Result<(), BrokerError> {
		let _guard = self.publish_lock.lock().await;
		let session = self.connected_session().ok_or(BrokerError::Disconnected)?;
		let exchange = self.config.topology.exchange.as_str();

		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.nack_retry_interval)
			.with_max_elapsed_time(Some(timeout))
			.build();
		backoff::future::retry_notify(
			policy,
			|| {
				let session = session.clone();
				async move {
					session
						.publish(exchange, message)
						.await
						.map_err(|e| match e {
							BrokerError::Nacked(_) => backoff::Error::transient(e),
							other => backoff::Error::permanent(other),
						})
				}
			},
			|e, next| debug!("Publish {} nacked ({}), retrying in {:?}", message.message_id, e, next),
		)
		.await
	}
}

impl Drop for ClientInner {
	fn drop(&mut self) {
		if let Some(monitor) = self.monitor.get_mut().take() {
			monitor.abort();
		}
		for consumer in self.consumers.get_mut().drain(..) {
			consumer.abort();
		}
	}
}

async fn left_connected(state_rx: &mut watch::Receiver<DeliveryState>) {
	let _ = state_rx
		.wait_for(|state| *state != DeliveryState::Connected)
		.await;
}

/// `false` if the client went away or closed.
async fn became_connected(state_rx: &mut watch::Receiver<DeliveryState>) -> bool {
	match state_rx
		.wait_for(|state| matches!(state, DeliveryState::Connected | DeliveryState::Closed))
		.await
	{
		Ok(state) => *state == DeliveryState::Connected,
		Err(_) => false,
	}
}

/// Waits for the session to close unexpectedly, then reconnects on a fixed delay.
fn monitor_connection(
	client: Weak<ClientInner>,
	session: Arc<dyn BrokerSession>,
) -> BoxFuture<'static, ()> {
	async move {
		let reason = session.closed().await;

		let delay = {
			let Some(inner) = client.upgrade() else {
				return;
			};
			if inner.closed.load(Ordering::SeqCst) {
				return;
			}
			let is_current = inner
				.session
				.read()
				.as_ref()
				.map(|current| Arc::ptr_eq(current, &session))
				.unwrap_or(false);
			if !is_current {
				return;
			}

			warn!("Broker connection lost: {}", reason);
			*inner.session.write() = None;
			inner.state_tx.send_replace(DeliveryState::Disconnected);
			inner.config.reconnect_delay
		};
		drop(session);

		let policy = ExponentialBackoffBuilder::new()
			.with_initial_interval(delay)
			.with_multiplier(1.0)
			.with_randomization_factor(0.0)
			.with_max_interval(delay)
			.with_max_elapsed_time(None)
			.build();

		tokio::time::sleep(delay).await;
		let result = backoff::future::retry_notify(
			policy,
			|| {
				let client = client.clone();
				async move {
					let inner = client
						.upgrade()
						.ok_or_else(|| backoff::Error::permanent(BrokerError::Closed))?;
					inner.establish().await.map_err(|e| match e {
						BrokerError::Closed => backoff::Error::permanent(e),
						other => backoff::Error::transient(other),
					})
				}
			},
			|e, next| warn!("Reconnect failed: {}, retrying in {:?}", e, next),
		)
		.await;

		match result {
			Ok(()) => {
				metrics::record_reconnect();
				info!("Broker connection re-established")
			}
			Err(e) => debug!("Reconnection stopped: {}", e),
		}
	}
	.boxed()
}

async fn consume_loop(
	client: Weak<ClientInner>,
	consumer: BatchConsumer,
	mut stop_rx: watch::Receiver<bool>,
) {
	loop {
		if *stop_rx.borrow() {
			return;
		}

		let (session, mut state_rx, config) = {
			let Some(inner) = client.upgrade() else {
				return;
			};
			if inner.closed.load(Ordering::SeqCst) {
				return;
			}
			(
				inner.connected_session(),
				inner.state_tx.subscribe(),
				inner.config.clone(),
			)
		};

		let Some(session) = session else {
			tokio::select! {
				connected = became_connected(&mut state_rx) => {
					if !connected {
						return;
					}
				}
				_ = stop_requested(&mut stop_rx) => return,
			}
			continue;
		};

		let deliveries = match session
			.consume(&config.topology.queue, &config.consumer_tag, config.prefetch)
			.await
		{
			Ok(deliveries) => deliveries,
			Err(e) => {
				warn!("Failed to subscribe to {}: {}", config.topology.queue, e);
				tokio::select! {
					_ = tokio::time::sleep(config.reconnect_delay) => {}
					_ = stop_requested(&mut stop_rx) => return,
				}
				continue;
			}
		};
		drop(session);

		info!(
			"Consuming from {} with prefetch {}",
			config.topology.queue, config.prefetch
		);
		match consumer.run(deliveries, stop_rx.clone()).await {
			ConsumeExit::Shutdown => return,
			ConsumeExit::StreamEnded => debug!("Delivery stream ended, waiting to resubscribe"),
		}
	}
}

/// Running consumer.
///
/// Dropping the handle leaves the consumer running until the client closes or
/// its last clone is dropped.
pub struct ConsumerHandle {
	stop: watch::Sender<bool>,
	task: JoinHandle<()>,
}

impl ConsumerHandle {
	/// Flush buffered records and stop.
	pub async fn shutdown(self) {
		self.stop.send_replace(true);
		if let Err(e) = self.task.await {
			if !e.is_cancelled() {
				warn!("Consumer task failed: {}", e);
			}
		}
	}

	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::consumer::{FlushTrigger, HandlerError};
	use crate::broker::memory::MemoryBroker;
	use crate::outbox::{EntityType, OperationType, SyncOperation};
	use parking_lot::Mutex as SyncMutex;
	use uuid::Uuid;

	fn test_config() -> BrokerConfig {
		BrokerConfig {
			region: "eu".to_string(),
			..BrokerConfig::default()
		}
	}

	fn make_record(priority: i32) -> WireRecord {
		let operation = SyncOperation::new(
			OperationType::Update,
			EntityType::Collection,
			"col-1",
			b"{}".to_vec(),
			priority,
		);
		WireRecord::new(operation, "eu", 1, "device-a")
	}

	fn client(broker: &MemoryBroker) -> BrokerClient {
		BrokerClient::new(test_config(), Arc::new(broker.connector()))
	}

	/// Accepts the TCP connection but never finishes the handshake.
	struct HangingConnector;

	#[async_trait::async_trait]
	impl BrokerConnector for HangingConnector {
		async fn connect(&self, _topology: &Topology) -> Result<Arc<dyn BrokerSession>, BrokerError> {
			std::future::pending().await
		}
	}

	#[derive(Default)]
	struct Collecting {
		ids: SyncMutex<Vec<Uuid>>,
	}

	#[async_trait::async_trait]
	impl RecordHandler for Collecting {
		async fn handle(&self, record: &WireRecord) -> Result<(), HandlerError> {
			self.ids.lock().push(record.operation.id);
			Ok(())
		}

		fn name(&self) -> &'static str {
			"collecting"
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_is_idempotent() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		assert_eq!(client.state(), DeliveryState::Disconnected);

		client.connect().await.unwrap();
		client.connect().await.unwrap();
		assert_eq!(client.state(), DeliveryState::Connected);

		client.publish(&make_record(0)).await.unwrap();
		assert_eq!(broker.queue_depth("sync_tasks"), 1);
		let message = &broker.ready_messages("sync_tasks")[0];
		assert_eq!(message.routing_key, "collection.eu");

		let exported = crate::metrics::encode_metrics().unwrap();
		assert!(exported.contains("field_sync_broker_publish_total{status=\"success\"}"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_gives_up_after_timeout() {
		let client = BrokerClient::new(test_config(), Arc::new(HangingConnector));
		let started = tokio::time::Instant::now();

		let result = client.connect().await;
		assert!(matches!(result, Err(BrokerError::Timeout(d)) if d == Duration::from_secs(10)));
		assert!(started.elapsed() >= Duration::from_secs(10));
		assert!(started.elapsed() < Duration::from_secs(11));
		assert_eq!(client.state(), DeliveryState::Disconnected);

		// The connect lock is released for the next attempt
		assert!(matches!(client.connect().await, Err(BrokerError::Timeout(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn test_queued_publish_is_bounded_by_publish_timeout() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();
		broker.stall_publishes(true);

		let started = tokio::time::Instant::now();
		let first = make_record(0);
		let second = make_record(1);
		let (a, b) = tokio::join!(client.publish(&first), client.publish(&second));
		assert!(matches!(a, Err(BrokerError::Timeout(_))));
		assert!(matches!(b, Err(BrokerError::Timeout(_))));
		assert!(started.elapsed() < Duration::from_secs(11));
	}

	#[tokio::test(start_paused = true)]
	async fn test_publish_without_connection_fails() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		assert!(matches!(
			client.publish(&make_record(0)).await,
			Err(BrokerError::Disconnected)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_breaker_opens_after_five_failures() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();
		broker.stall_publishes(true);

		for _ in 0..5 {
			assert!(matches!(
				client.publish(&make_record(0)).await,
				Err(BrokerError::Timeout(_))
			));
		}
		assert_eq!(client.circuit_state(), CircuitState::Open);

		let attempts = broker.publish_attempts();
		assert!(matches!(
			client.publish(&make_record(0)).await,
			Err(BrokerError::CircuitOpen { .. })
		));
		assert_eq!(broker.publish_attempts(), attempts);

		broker.stall_publishes(false);
		tokio::time::advance(Duration::from_secs(61)).await;
		client.publish(&make_record(0)).await.unwrap();
		assert_eq!(client.circuit_state(), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn test_nacked_publish_is_retried() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();
		broker.fail_next_publishes(2);

		client.publish(&make_record(0)).await.unwrap();
		assert_eq!(broker.publish_attempts(), 3);
		assert_eq!(broker.queue_depth("sync_tasks"), 1);
		assert_eq!(client.circuit_state(), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnect_fails_in_flight_publish() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();
		broker.stall_publishes(true);

		let publisher = {
			let client = client.clone();
			tokio::spawn(async move { client.publish(&make_record(0)).await })
		};
		tokio::time::sleep(Duration::from_millis(100)).await;
		broker.set_available(false);

		let result = publisher.await.unwrap();
		assert!(matches!(result, Err(BrokerError::Disconnected)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_monitor_reconnects_after_outage() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();
		let mut state_rx = client.watch_state();

		broker.set_available(false);
		state_rx
			.wait_for(|s| *s == DeliveryState::Disconnected)
			.await
			.unwrap();

		// Still offline after the first retry
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_ne!(client.state(), DeliveryState::Connected);

		broker.set_available(true);
		state_rx
			.wait_for(|s| *s == DeliveryState::Connected)
			.await
			.unwrap();
		client.publish(&make_record(0)).await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_close_stops_reconnecting() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();

		client.close().await.unwrap();
		assert_eq!(client.state(), DeliveryState::Closed);
		assert!(matches!(client.connect().await, Err(BrokerError::Closed)));
		assert!(matches!(
			client.publish(&make_record(0)).await,
			Err(BrokerError::Closed)
		));

		broker.sever_connections();
		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(client.state(), DeliveryState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn test_consumer_resubscribes_after_reconnect() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();

		let handler = Arc::new(Collecting::default());
		let (report_tx, mut report_rx) = mpsc::unbounded_channel();
		let consumer = client.consume_with_reports(handler.clone(), Some(report_tx));

		let first = make_record(0);
		client.publish(&first).await.unwrap();
		let report = report_rx.recv().await.unwrap();
		assert_eq!(report.trigger, FlushTrigger::Timer);
		assert_eq!(report.acked, 1);

		let mut state_rx = client.watch_state();
		broker.sever_connections();
		state_rx
			.wait_for(|s| *s != DeliveryState::Connected)
			.await
			.unwrap();
		state_rx
			.wait_for(|s| *s == DeliveryState::Connected)
			.await
			.unwrap();

		let second = make_record(1);
		client.publish(&second).await.unwrap();
		let report = report_rx.recv().await.unwrap();
		assert_eq!(report.acked, 1);
		assert_eq!(
			*handler.ids.lock(),
			vec![first.operation.id, second.operation.id]
		);

		consumer.shutdown().await;
		client.close().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_dropped_handle_keeps_consuming() {
		let broker = MemoryBroker::new();
		let client = client(&broker);
		client.connect().await.unwrap();

		let handler = Arc::new(Collecting::default());
		let (report_tx, mut report_rx) = mpsc::unbounded_channel();
		drop(client.consume_with_reports(handler.clone(), Some(report_tx)));

		let record = make_record(0);
		client.publish(&record).await.unwrap();
		let report = report_rx.recv().await.unwrap();
		assert_eq!(report.acked, 1);
		assert_eq!(*handler.ids.lock(), vec![record.operation.id]);
		assert_eq!(broker.queue_depth("sync_tasks"), 0);
		let exported = crate::metrics::encode_metrics().unwrap();
		assert!(exported.contains("field_sync_consume_total{status=\"acked\"}"));

		client.close().await.unwrap();
	}
}
