//! Prometheus metrics for the sync pipeline
//!
//! Covers the broker client and the receiving consumer, as well as the coordinator:
//! - Publishes by outcome
//! - Reconnections made by the monitor
//! - Consumed records by outcome, with per-record handling latency
//! - Sync cycles by outcome, with cycle latency
//!
//! Metrics live in a registry owned by this crate. Hosts expose them with
//! [`encode_metrics`]. If registration fails, recording becomes a no-op.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics unavailable")]
    Unavailable,

    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct SyncMetrics {
    registry: Registry,
    /// Publishes by status (success, error, circuit_open)
    publish_total: IntCounterVec,
    reconnects_total: IntCounter,
    /// Consumed records by status (acked, failed)
    consume_total: IntCounterVec,
    processing_seconds: Histogram,
    /// Sync cycles by trigger and result
    cycles_total: IntCounterVec,
    cycle_seconds: HistogramVec,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let publish_total = IntCounterVec::new(
            Opts::new(
                "field_sync_broker_publish_total",
                "Records published to the broker by outcome",
            ),
            &["status"],
        )?;
        let reconnects_total = IntCounter::new(
            "field_sync_broker_reconnects_total",
            "Connections re-established after an unexpected closure",
        )?;
        let consume_total = IntCounterVec::new(
            Opts::new(
                "field_sync_consume_total",
                "Records handled by the batch consumer by outcome",
            ),
            &["status"],
        )?;
        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "field_sync_record_processing_seconds",
                "Time spent handling one consumed record",
            )
            .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0]),
        )?;
        let cycles_total = IntCounterVec::new(
            Opts::new("field_sync_cycles_total", "Sync cycles by trigger and result"),
            &["trigger", "result"],
        )?;
        let cycle_seconds = HistogramVec::new(
            HistogramOpts::new("field_sync_cycle_duration_seconds", "Sync cycle latency")
                .buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0]),
            &["result"],
        )?;

        registry.register(Box::new(publish_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(consume_total.clone()))?;
        registry.register(Box::new(processing_seconds.clone()))?;
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_seconds.clone()))?;

        Ok(Self {
            registry,
            publish_total,
            reconnects_total,
            consume_total,
            processing_seconds,
            cycles_total,
            cycle_seconds,
        })
    }

    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

lazy_static! {
    static ref METRICS: Option<SyncMetrics> = match SyncMetrics::new() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("Failed to register metrics: {}", e);
            None
        }
    };
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, MetricsError> {
    METRICS.as_ref().ok_or(MetricsError::Unavailable)?.encode()
}

/// Record the outcome of one publish
pub fn record_publish(status: &str) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.publish_total.with_label_values(&[status]).inc();
    }
}

pub fn record_reconnect() {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.reconnects_total.inc();
    }
}

/// Record one consumed record and how long its handler took
pub fn record_consumed(status: &str, duration_secs: f64) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.consume_total.with_label_values(&[status]).inc();
        metrics.processing_seconds.observe(duration_secs);
    }
}

/// Record a finished sync cycle
pub fn record_cycle(trigger: &str, result: &str, duration_secs: f64) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics
            .cycles_total
            .with_label_values(&[trigger, result])
            .inc();
        metrics
            .cycle_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }
}
