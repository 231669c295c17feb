//! Sync coordinator and integration point for all sync services.
//!
//! This module defines the `SyncCoordinator`, which owns the sync state machine
//! `Idle → Syncing → {Completed, Error} → Idle`. Cycles run on one dedicated worker
//! task, so at most one cycle is ever in flight. The coordinator is responsible for:
//! - Accepting local mutations into the pending-operation store and advancing the clock
//! - Starting cycles from the periodic timer, connectivity changes and explicit requests
//! - Uploading pending operations and confirming what the upload path acknowledged
//! - Pulling remote changes since the last watermark and applying the winners locally
//! - Publishing every transition on the status stream
//!
//! Triggers never block: a request made while a cycle is running is rejected
//! rather than queued behind it.

use crate::backend::RemoteChangeSource;
use crate::metrics;
use crate::outbox::{PendingOperationStore, SyncOperation};
use crate::sync::{
    apply::ChangeApplier,
    clock::{ClockStamp, LogicalClock},
    conflict::RemoteChange,
    events::{HandlerId, StatusBroadcaster, StatusSubscription, SyncEventHandler},
    local_store::LocalEntityStore,
    progress_tracker::CycleTracker,
    repositories::PersistedSyncState,
    state_persistence::SyncStatePersistence,
    strategies::UploadStrategy,
    triggers::{BackgroundScheduler, BackgroundTask, ConnectivityMonitor},
    types::{SyncError, SyncReport, SyncStatus, SyncTrigger},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const IDLE: u8 = 0;
const SYNCING: u8 = 1;

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct SyncCoordinatorConfig {
    /// Used for a fresh clock; a persisted clock keeps its own id.
    pub device_id: String,
    /// Upper bound of operations uploaded per cycle.
    pub max_batch_size: usize,
    /// Periodic sync interval.
    pub sync_interval: Duration,
    /// Interval of the coarse background refresh requested from the host.
    pub coarse_refresh_interval: Duration,
    pub remote_page_size: u32,
    pub max_remote_pages: u32,
    /// Operations at or above this priority request an immediate background sync.
    pub high_priority_threshold: i32,
    /// Bound on every network call of a cycle.
    pub network_timeout: Duration,
    pub sync_on_reconnect: bool,
}

impl Default for SyncCoordinatorConfig {
    fn default() -> Self {
        Self {
            device_id: "device".to_string(),
            max_batch_size: 100,
            sync_interval: Duration::from_secs(300),
            coarse_refresh_interval: Duration::from_secs(3600),
            remote_page_size: 100,
            max_remote_pages: 50,
            high_priority_threshold: 10,
            network_timeout: Duration::from_secs(30),
            sync_on_reconnect: true,
        }
    }
}

/// Collaborators wired into the coordinator
pub struct SyncDependencies {
    pub store: PendingOperationStore,
    pub uploader: Arc<dyn UploadStrategy>,
    pub remote: Arc<dyn RemoteChangeSource>,
    pub local: Arc<dyn LocalEntityStore>,
    pub persistence: SyncStatePersistence,
    pub connectivity: Arc<dyn ConnectivityMonitor>,
    pub scheduler: Arc<dyn BackgroundScheduler>,
}

type CycleReply = oneshot::Sender<Result<SyncReport, SyncError>>;

struct CycleRequest {
    trigger: SyncTrigger,
    reply: Option<CycleReply>,
}

/// State shared by coordinator handles and the worker
struct Shared {
    config: SyncCoordinatorConfig,
    store: PendingOperationStore,
    persistence: SyncStatePersistence,
    local: Arc<dyn LocalEntityStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    scheduler: Arc<dyn BackgroundScheduler>,
    events: StatusBroadcaster,
    phase: AtomicU8,
    /// Held across the save so that saves land in clock order.
    state: Mutex<PersistedSyncState>,
}

impl Shared {
    fn try_begin(&self) -> bool {
        self.phase
            .compare_exchange(IDLE, SYNCING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end(&self) {
        self.phase.store(IDLE, Ordering::Release);
    }

    fn is_syncing(&self) -> bool {
        self.phase.load(Ordering::Acquire) == SYNCING
    }
}

struct Control {
    shutdown: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the sync coordinator.
///
/// Cloning is cheap. The worker stops on `shutdown` or when the last handle is dropped.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<CycleRequest>,
    control: Arc<Control>,
}

impl SyncCoordinator {
    /// Restore persisted state, register recurring host wake-ups and spawn the worker.
    pub async fn start(
        deps: SyncDependencies,
        config: SyncCoordinatorConfig,
    ) -> Result<Self, SyncError> {
        let restored = deps.persistence.restore_or_init(&config.device_id).await?;
        info!(
            "Sync coordinator starting for device {} at clock {}",
            restored.clock.device_id(),
            restored.clock.counter()
        );

        deps.scheduler
            .schedule_recurring(BackgroundTask::PeriodicSync, config.sync_interval);
        deps.scheduler.schedule_recurring(
            BackgroundTask::CoarseRefresh,
            config.coarse_refresh_interval,
        );

        let connectivity = deps.connectivity.subscribe();
        let shared = Arc::new(Shared {
            config,
            store: deps.store,
            persistence: deps.persistence,
            local: deps.local.clone(),
            connectivity: deps.connectivity,
            scheduler: deps.scheduler,
            events: StatusBroadcaster::new(),
            phase: AtomicU8::new(IDLE),
            state: Mutex::new(restored),
        });

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            runner: CycleRunner {
                shared: shared.clone(),
                uploader: deps.uploader,
                remote: deps.remote,
                applier: ChangeApplier::new(deps.local),
            },
            requests: request_rx,
            shutdown: shutdown_rx,
            connectivity,
        };
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            shared,
            requests,
            control: Arc::new(Control {
                shutdown,
                worker: parking_lot::Mutex::new(Some(handle)),
            }),
        })
    }

    /// Record a local mutation and return the stamp it was queued under.
    ///
    /// The clock is ticked and saved first, so a counter is never handed out
    /// before it is durable. The stamp is written to the local entity store and
    /// travels with the operation, so each edit carries its own version. The
    /// operation is durable once this returns `Ok`; any persistence failure is
    /// returned and the operation is not queued.
    pub async fn queue_operation(
        &self,
        operation: SyncOperation,
    ) -> Result<ClockStamp, SyncError> {
        let id = operation.id;
        let priority = operation.priority;

        let stamp = {
            let mut state = self.shared.state.lock().await;
            let stamp = state.clock.tick();
            self.shared
                .persistence
                .save(&state.clock, state.last_sync)
                .await?;

            let operation = operation.with_version(stamp.counter);
            self.shared.local.record_local(&operation, &stamp).await?;
            self.shared.store.enqueue(operation).await?;
            stamp
        };
        debug!("Queued operation {} at clock {}", id, stamp.counter);

        if priority >= self.shared.config.high_priority_threshold {
            info!(
                "Operation {} has priority {}, requesting immediate sync",
                id, priority
            );
            self.shared.scheduler.request_immediate_sync();
        }
        Ok(stamp)
    }

    /// Request a cycle. Returns `false` without effect if one is already running.
    pub fn start_sync(&self) -> bool {
        self.request(SyncTrigger::Explicit, None).is_ok()
    }

    /// Run one cycle to completion and return its report.
    ///
    /// This is the entry point for the host's background-task hook.
    pub async fn run_sync_cycle(&self) -> Result<SyncReport, SyncError> {
        self.run_triggered(SyncTrigger::Background).await
    }

    async fn run_triggered(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let (reply, response) = oneshot::channel();
        self.request(trigger, Some(reply))?;
        response.await.unwrap_or(Err(SyncError::ShutDown))
    }

    fn request(&self, trigger: SyncTrigger, reply: Option<CycleReply>) -> Result<(), SyncError> {
        if !self.shared.try_begin() {
            debug!("Sync already in progress, ignoring {:?} request", trigger);
            return Err(SyncError::AlreadyInProgress);
        }
        if self.requests.send(CycleRequest { trigger, reply }).is_err() {
            self.shared.end();
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.events.current()
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.is_syncing()
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.shared.events.subscribe()
    }

    pub fn register_handler(&self, handler: Arc<dyn SyncEventHandler>) -> HandlerId {
        self.shared.events.register_handler(handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.shared.events.unregister_handler(id)
    }

    /// Snapshot of the device clock.
    pub async fn clock(&self) -> LogicalClock {
        self.shared.state.lock().await.clock.clone()
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().await.last_sync
    }

    /// Stop the worker after the cycle in flight, if any, finishes.
    pub async fn shutdown(&self) {
        let _ = self.control.shutdown.send(true);
        let handle = self.control.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Sync worker ended abnormally: {}", e);
            }
        }
    }
}

/// Completes on a shutdown request or when every coordinator handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct Worker {
    runner: CycleRunner,
    requests: mpsc::UnboundedReceiver<CycleRequest>,
    shutdown: watch::Receiver<bool>,
    connectivity: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        let Worker {
            runner,
            mut requests,
            mut shutdown,
            mut connectivity,
        } = self;
        let shared = runner.shared.clone();
        let interval = shared.config.sync_interval;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reachable = *connectivity.borrow_and_update();
        let mut watching_connectivity = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break,

                request = requests.recv() => match request {
                    Some(request) => runner.run_cycle(request.trigger, request.reply).await,
                    None => break,
                },

                _ = ticker.tick() => {
                    if shared.try_begin() {
                        runner.run_cycle(SyncTrigger::Periodic, None).await;
                    } else {
                        debug!("Periodic sync skipped, cycle in progress");
                    }
                }

                changed = connectivity.changed(), if watching_connectivity => {
                    if changed.is_err() {
                        watching_connectivity = false;
                        continue;
                    }
                    let now_reachable = *connectivity.borrow_and_update();
                    let restored = now_reachable && !reachable;
                    reachable = now_reachable;
                    if restored && shared.config.sync_on_reconnect && shared.try_begin() {
                        runner.run_cycle(SyncTrigger::ConnectivityRestored, None).await;
                    }
                }
            }
        }

        info!("Sync worker stopped");
    }
}

/// Executes cycles; only ever used from the worker task
struct CycleRunner {
    shared: Arc<Shared>,
    uploader: Arc<dyn UploadStrategy>,
    remote: Arc<dyn RemoteChangeSource>,
    applier: ChangeApplier,
}

impl CycleRunner {
    /// Run a cycle whose phase flag has already been claimed.
    async fn run_cycle(&self, trigger: SyncTrigger, reply: Option<CycleReply>) {
        let events = &self.shared.events;
        events.emit(SyncStatus::Syncing);
        info!("Sync cycle started ({:?}, {} upload)", trigger, self.uploader.name());

        let started = Instant::now();
        let result = self.execute(trigger).await;
        metrics::record_cycle(
            trigger.as_str(),
            if result.is_ok() { "completed" } else { "failed" },
            started.elapsed().as_secs_f64(),
        );
        match &result {
            Ok(report) => {
                info!("{}", report.summary());
                events.emit(SyncStatus::Completed(report.clone()));
            }
            Err(e) => {
                warn!("Sync cycle failed: {}", e);
                events.emit(SyncStatus::Error(e.to_failure()));
            }
        }

        self.shared.end();
        events.emit(SyncStatus::Idle);

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn execute(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        let shared = &self.shared;
        let config = &shared.config;

        if !shared.connectivity.is_reachable() {
            return Err(SyncError::Connectivity);
        }

        let mut tracker = CycleTracker::new(trigger);

        // Upload
        let batch = shared.store.dequeue_batch(config.max_batch_size).await?;
        if !batch.is_empty() {
            let stamp = shared.state.lock().await.clock.stamp();
            let outcome = self.uploader.upload(&batch, &stamp).await;

            // Whatever was acknowledged is confirmed even if the rest failed
            let confirmed = if outcome.acknowledged.is_empty() {
                0
            } else {
                shared.store.confirm(&outcome.acknowledged).await?
            };
            tracker.record_upload(outcome.acknowledged.len(), confirmed);

            if let Some(failure) = outcome.failure {
                return Err(failure);
            }
        }
        {
            let mut state = shared.state.lock().await;
            state.clock.tick();
            shared.persistence.save(&state.clock, state.last_sync).await?;
        }

        // Pull
        let since = shared.state.lock().await.last_sync;
        let (changes, watermark) = self.fetch_remote(since, &mut tracker).await?;

        // Apply
        let mut highest_version = 0;
        for change in &changes {
            let resolution = self.applier.apply(change).await?;
            tracker.record_resolution(resolution);
            highest_version = highest_version.max(change.version);
        }

        let mut state = shared.state.lock().await;
        state.clock.observe(highest_version);
        state.last_sync = Some(watermark);
        shared.persistence.save(&state.clock, state.last_sync).await?;

        Ok(tracker.finish(state.clock.counter(), watermark))
    }

    /// Page through remote changes newer than `since`.
    ///
    /// Returns the parsed changes and the watermark for the next pull. When the
    /// page limit cuts the pull short, the watermark is the newest change seen so
    /// the remainder is fetched next time.
    async fn fetch_remote(
        &self,
        since: Option<DateTime<Utc>>,
        tracker: &mut CycleTracker,
    ) -> Result<(Vec<RemoteChange>, DateTime<Utc>), SyncError> {
        let config = &self.shared.config;
        let started = Utc::now();
        let mut changes = Vec::new();
        let mut page = 1;

        loop {
            let result = tokio::time::timeout(
                config.network_timeout,
                self.remote.fetch_page(since, page, config.remote_page_size),
            )
            .await
            .map_err(|_| SyncError::Timeout("remote fetch", config.network_timeout))??;

            tracker.record_fetched(result.items.len());
            for item in result.items {
                match RemoteChange::parse(item) {
                    Some(change) => changes.push(change),
                    None => {
                        warn!("Skipping malformed remote record on page {}", page);
                        tracker.record_malformed();
                    }
                }
            }

            if !result.has_more {
                return Ok((changes, started));
            }
            if page >= config.max_remote_pages {
                warn!(
                    "Remote pull stopped after {} pages, continuing next cycle",
                    page
                );
                let newest = changes
                    .iter()
                    .map(|c| c.updated_at)
                    .max()
                    .or(since)
                    .unwrap_or(started);
                return Ok((changes, newest));
            }
            page += 1;
        }
    }
}
