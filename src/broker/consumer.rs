//! Batch consumer.
//!
//! Deliveries are buffered and flushed either when the buffer reaches
//! `max_batch_size` or when `flush_interval` has passed since the last flush.
//! On flush the handler runs once per record, in receipt order, and each record
//! is acknowledged as soon as its handler succeeds.

use crate::broker::codec;
use crate::broker::transport::{Delivery, DeliveryStream};
use crate::broker::types::WireRecord;
use crate::metrics;
use crate::sync::apply::ChangeApplier;
use crate::sync::conflict::RemoteChange;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Processes one received record. Handlers must be idempotent: a record may be
/// delivered more than once.
#[async_trait::async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &WireRecord) -> Result<(), HandlerError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    /// Final flush on shutdown.
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub records: usize,
    pub acked: usize,
    pub failed: usize,
}

/// Why the consume loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeExit {
    /// The delivery stream ended, usually because the connection dropped.
    StreamEnded,
    Shutdown,
}

struct Pending {
    delivery: Delivery,
    record: WireRecord,
}

pub struct BatchConsumer {
    config: BatchConfig,
    handler: Arc<dyn RecordHandler>,
    reports: Option<mpsc::UnboundedSender<FlushReport>>,
}

impl BatchConsumer {
    pub fn new(config: BatchConfig, handler: Arc<dyn RecordHandler>) -> Self {
        Self {
            config,
            handler,
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<FlushReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Consume until the stream ends or `shutdown` flips to `true`. A dropped
    /// shutdown sender never stops the consumer.
    ///
    /// Records buffered when the stream ends are dropped unacknowledged; the
    /// broker redelivers them.
    pub async fn run(
        &self,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumeExit {
        let max_batch = self.config.max_batch_size.max(1);
        let mut batch: Vec<Pending> = Vec::with_capacity(max_batch);
        let mut deadline = Instant::now() + self.config.flush_interval;

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => {
                    self.flush(&mut batch, FlushTrigger::Drain).await;
                    return ConsumeExit::Shutdown;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Some(pending) = self.decode(delivery).await {
                            batch.push(pending);
                        }
                        if batch.len() >= max_batch {
                            self.flush(&mut batch, FlushTrigger::Size).await;
                            deadline = Instant::now() + self.config.flush_interval;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Delivery stream failed: {}", e);
                        return self.abandon(batch);
                    }
                    None => return self.abandon(batch),
                },
                _ = sleep_until(deadline) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch, FlushTrigger::Timer).await;
                    }
                    deadline = Instant::now() + self.config.flush_interval;
                }
            }
        }
    }

    fn abandon(&self, batch: Vec<Pending>) -> ConsumeExit {
        if !batch.is_empty() {
            info!(
                "Delivery stream ended with {} unprocessed records, leaving them for redelivery",
                batch.len()
            );
        }
        ConsumeExit::StreamEnded
    }

    async fn decode(&self, delivery: Delivery) -> Option<Pending> {
        match codec::decode(&delivery.body, &delivery.headers) {
            Ok(record) => Some(Pending { delivery, record }),
            Err(e) => {
                let requeue = !delivery.redelivered;
                warn!(requeue, "Rejecting undecodable message: {}", e);
                if let Err(e) = delivery.acker.nack(requeue).await {
                    error!("Failed to reject message: {}", e);
                }
                None
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Pending>, trigger: FlushTrigger) {
        if batch.is_empty() {
            return;
        }

        let mut report = FlushReport {
            trigger,
            records: batch.len(),
            acked: 0,
            failed: 0,
        };

        for Pending { delivery, record } in batch.drain(..) {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.handler.handle(&record))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed().as_secs_f64();
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.0),
                Err(_) => Some(format!("handler {} panicked", self.handler.name())),
            };

            match failure {
                None => match delivery.acker.ack().await {
                    Ok(()) => {
                        report.acked += 1;
                        metrics::record_consumed("acked", elapsed);
                    }
                    Err(e) => {
                        error!("Failed to ack {}: {}", record.operation.id, e);
                        report.failed += 1;
                        metrics::record_consumed("failed", elapsed);
                    }
                },
                Some(reason) => {
                    report.failed += 1;
                    metrics::record_consumed("failed", elapsed);
                    let requeue = !delivery.redelivered;
                    warn!(
                        id = %record.operation.id,
                        requeue,
                        "Handler {} failed: {}",
                        self.handler.name(),
                        reason
                    );
                    if let Err(e) = delivery.acker.nack(requeue).await {
                        error!("Failed to reject {}: {}", record.operation.id, e);
                    }
                }
            }
        }

        debug!(
            "Flushed {} records ({:?}): {} acked, {} failed",
            report.records, report.trigger, report.acked, report.failed
        );
        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }
}

/// Pends forever once the sender is gone without signalling.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

const DEFAULT_REMEMBERED_IDS: usize = 10_000;

/// Skips records whose operation id was already handled successfully.
///
/// Remembers the most recent `capacity` ids.
pub struct IdempotentHandler {
    inner: Arc<dyn RecordHandler>,
    capacity: usize,
    applied: Mutex<AppliedIds>,
}

#[derive(Default)]
struct AppliedIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl IdempotentHandler {
    pub fn new(inner: Arc<dyn RecordHandler>) -> Self {
        Self::with_capacity(inner, DEFAULT_REMEMBERED_IDS)
    }

    pub fn with_capacity(inner: Arc<dyn RecordHandler>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            applied: Mutex::new(AppliedIds::default()),
        }
    }

    fn already_applied(&self, id: &Uuid) -> bool {
        self.applied.lock().ids.contains(id)
    }

    fn remember(&self, id: Uuid) {
        let mut applied = self.applied.lock();
        if !applied.ids.insert(id) {
            return;
        }
        applied.order.push_back(id);
        while applied.order.len() > self.capacity {
            if let Some(evicted) = applied.order.pop_front() {
                applied.ids.remove(&evicted);
            }
        }
    }
}

#[async_trait::async_trait]
impl RecordHandler for IdempotentHandler {
    async fn handle(&self, record: &WireRecord) -> Result<(), HandlerError> {
        let id = record.operation.id;
        if self.already_applied(&id) {
            debug!("Skipping already applied operation {}", id);
            return Ok(());
        }
        self.inner.handle(record).await?;
        self.remember(id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Applies received records to a local entity store with the clock conflict rule
pub struct StoreApplier {
    applier: ChangeApplier,
}

impl StoreApplier {
    pub fn new(applier: ChangeApplier) -> Self {
        Self { applier }
    }
}

pub fn remote_change_from_record(record: &WireRecord) -> RemoteChange {
    let operation = &record.operation;
    RemoteChange {
        id: operation.id,
        entity_type: operation.entity_type,
        entity_id: operation.entity_id.clone(),
        operation_type: operation.operation_type,
        data: operation.payload.clone(),
        version: record.version,
        device_id: record.device_id.clone(),
        updated_at: operation.timestamp,
    }
}

#[async_trait::async_trait]
impl RecordHandler for StoreApplier {
    async fn handle(&self, record: &WireRecord) -> Result<(), HandlerError> {
        self.applier
            .apply(&remote_change_from_record(record))
            .await
            .map(|_| ())
            .map_err(|e| HandlerError(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "store_applier"
    }
}
