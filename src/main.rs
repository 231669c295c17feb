use backoff::ExponentialBackoffBuilder;
use field_sync::backend::BackendClient;
use field_sync::broker::{
	AmqpConnector, BrokerClient, DeliveryState, IdempotentHandler, StoreApplier,
};
use field_sync::config::{Config, UploadMode};
use field_sync::outbox::PendingOperationStore;
use field_sync::sync::apply::ChangeApplier;
use field_sync::sync::local_store::InMemoryEntityStore;
use field_sync::sync::state_persistence::SyncStatePersistence;
use field_sync::sync::strategies::{BrokerUpload, DirectUpload, UploadStrategy};
use field_sync::sync::triggers::{ConnectivityState, LoggingScheduler};
use field_sync::sync::{SyncCoordinator, SyncDependencies};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
	let mut filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
	if let Ok(directive) = "lapin=warn".parse() {
		filter = filter.add_directive(directive);
	}
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	dotenvy::dotenv().ok();
	let config = match Config::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return;
		}
	};

	info!(
		"Starting sync service for device {} in region {}",
		config.sync.device_id, config.broker.region
	);

	let backend = match BackendClient::new(config.backend_url.clone(), config.backend_timeout) {
		Ok(client) => client,
		Err(e) => {
			error!("Failed to create backend client: {}", e);
			return;
		}
	};
	info!("Created backend client for {}", backend.base_url());

	let broker = BrokerClient::new(
		config.broker.clone(),
		Arc::new(AmqpConnector::new(config.queue.amqp_uri())),
	);

	// Reachability follows the broker connection in broker mode
	let connectivity = Arc::new(ConnectivityState::new(
		config.upload_mode == UploadMode::Direct,
	));
	if config.upload_mode == UploadMode::Broker {
		tokio::spawn(mirror_broker_state(broker.clone(), connectivity.clone()));
		tokio::spawn(connect_until_up(broker.clone()));
	}

	let uploader: Arc<dyn UploadStrategy> = match config.upload_mode {
		UploadMode::Broker => Arc::new(BrokerUpload::new(broker.clone())),
		UploadMode::Direct => Arc::new(DirectUpload::new(
			Arc::new(backend.clone()),
			config.backend_timeout,
		)),
	};

	let local = Arc::new(InMemoryEntityStore::new());
	let coordinator = match SyncCoordinator::start(
		SyncDependencies {
			store: PendingOperationStore::file(config.data_dir.join("pending")),
			uploader,
			remote: Arc::new(backend),
			local: local.clone(),
			persistence: SyncStatePersistence::file(config.data_dir.clone()),
			connectivity,
			scheduler: Arc::new(LoggingScheduler),
		},
		config.sync.clone(),
	)
	.await
	{
		Ok(coordinator) => coordinator,
		Err(e) => {
			error!("Failed to start sync coordinator: {}", e);
			return;
		}
	};
	info!("Sync coordinator running");

	let consumer = if config.consumer_enabled {
		let handler = IdempotentHandler::new(Arc::new(StoreApplier::new(ChangeApplier::new(local))));
		Some(broker.consume(Arc::new(handler)))
	} else {
		None
	};

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}
	info!("Shutting down");

	coordinator.shutdown().await;
	if let Some(consumer) = consumer {
		consumer.shutdown().await;
	}
	if let Err(e) = broker.close().await {
		warn!("Failed to close broker connection: {}", e);
	}
	match field_sync::metrics::encode_metrics() {
		Ok(text) => debug!("Final metrics:\n{}", text),
		Err(e) => warn!("Failed to encode metrics: {}", e),
	}
}

/// Keep the connectivity flag in step with the broker connection.
async fn mirror_broker_state(broker: BrokerClient, connectivity: Arc<ConnectivityState>) {
	let mut state = broker.watch_state();
	loop {
		let current = *state.borrow_and_update();
		connectivity.set_reachable(current == DeliveryState::Connected);
		if current == DeliveryState::Closed || state.changed().await.is_err() {
			return;
		}
	}
}

/// Retry the first connection; afterwards the client's monitor takes over.
async fn connect_until_up(broker: BrokerClient) {
	let delay = broker.config().reconnect_delay;
	let policy = ExponentialBackoffBuilder::new()
		.with_initial_interval(delay)
		.with_multiplier(1.0)
		.with_randomization_factor(0.0)
		.with_max_interval(delay)
		.with_max_elapsed_time(None)
		.build();

	let result = backoff::future::retry_notify(
		policy,
		|| async {
			broker.connect().await.map_err(|e| {
				if e.is_retryable() {
					backoff::Error::transient(e)
				} else {
					backoff::Error::permanent(e)
				}
			})
		},
		|e, next| warn!("Broker unavailable: {}, retrying in {:?}", e, next),
	)
	.await;

	if let Err(e) = result {
		error!("Giving up on broker connection: {}", e);
	}
}
