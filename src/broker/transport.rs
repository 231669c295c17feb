//! Transport seam between the broker client and a concrete message broker.

use crate::broker::codec::OutgoingMessage;
use crate::broker::types::{BrokerError, HeaderValue};
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Exchange, queue and dead-letter wiring declared on every (re)connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange.
    pub exchange: String,
    /// Durable queue bound to `exchange`.
    pub queue: String,
    pub binding_key: String,
    /// Fanout exchange receiving rejected messages, if any.
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_queue: Option<String>,
}

impl Topology {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: "#".to_string(),
            dead_letter_exchange: None,
            dead_letter_queue: None,
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        self.dead_letter_queue = Some(format!("{}.queue", exchange));
        self.dead_letter_exchange = Some(exchange);
        self
    }
}

/// Opens sessions with the broker
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and declare `topology`.
    async fn connect(&self, topology: &Topology) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// One live connection to the broker
#[async_trait::async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish and wait for the broker's confirm.
    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), BrokerError>;

    /// Subscribe with at most `prefetch` unacknowledged deliveries outstanding.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Resolves when the connection closes, with the reason.
    async fn closed(&self) -> String;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A received message and the handle used to settle it
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, HeaderValue>,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}
