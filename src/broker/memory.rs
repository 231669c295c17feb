//! In-process broker with topic routing, prefetch, acknowledgements and
//! dead-lettering.
//!
//! Used for local runs without a broker and by the test suite, which also uses
//! the fault hooks (`set_available`, `sever_connections`, `fail_next_publishes`,
//! `stall_publishes`) to exercise reconnection and the circuit breaker.

use crate::broker::codec::OutgoingMessage;
use crate::broker::transport::{
    BrokerConnector, BrokerSession, Delivery, DeliveryAcker, DeliveryStream, Topology,
};
use crate::broker::types::{BrokerError, HeaderValue};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, watch};
use tracing::debug;

/// A message held by the in-process broker
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub message_id: String,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    Topic,
    Fanout,
}

struct Exchange {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, StoredMessage>,
    dead_letter_exchange: Option<String>,
}

#[derive(Default)]
struct BrokerInner {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    dead_letters: Vec<StoredMessage>,
    next_tag: u64,
}

impl BrokerInner {
    fn route(&mut self, exchange: &str, message: StoredMessage) -> Result<usize, BrokerError> {
        let targets: Vec<String> = {
            let exchange = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::Topology(format!("no exchange {}", exchange)))?;
            exchange
                .bindings
                .iter()
                .filter(|(_, key)| match exchange.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(key, &message.routing_key),
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(targets.len())
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = false;
        self.dead_letters.push(message.clone());
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        if let Some(dlx) = dlx {
            if let Err(e) = self.route(&dlx, message) {
                debug!("Dead-letter routing failed: {}", e);
            }
        }
    }
}

struct BrokerState {
    inner: Mutex<BrokerInner>,
    available: AtomicBool,
    stall_publishes: AtomicBool,
    failing_publishes: AtomicUsize,
    publish_attempts: AtomicUsize,
    generation: watch::Sender<u64>,
    changed: Notify,
}

impl BrokerState {
    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

/// Shared handle to an in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(BrokerInner::default()),
                available: AtomicBool::new(true),
                stall_publishes: AtomicBool::new(false),
                failing_publishes: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
                generation,
                changed: Notify::new(),
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Toggle reachability. Going unavailable drops every open connection.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
        if !available {
            self.sever_connections();
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Drop every open connection. Unacknowledged deliveries return to the
    /// front of their queues flagged as redelivered.
    pub fn sever_connections(&self) {
        {
            let mut inner = self.state.inner.lock();
            for queue in inner.queues.values_mut() {
                let unacked = std::mem::take(&mut queue.unacked);
                for (_, mut message) in unacked.into_iter().rev() {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        self.state.generation.send_modify(|g| *g += 1);
        self.state.changed.notify_waiters();
    }

    /// Reject the next `count` publishes with a negative confirm.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Hold publishes without confirming until the connection drops.
    pub fn stall_publishes(&self, stall: bool) {
        self.state.stall_publishes.store(stall, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    /// Ready plus unacknowledged messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Messages waiting for delivery in `queue`, in delivery order.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        let inner = self.state.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<StoredMessage> {
        self.state.inner.lock().dead_letters.clone()
    }

    fn declare(&self, topology: &Topology) {
        let mut inner = self.state.inner.lock();
        inner
            .exchanges
            .entry(topology.exchange.clone())
            .or_insert_with(|| Exchange {
                kind: ExchangeKind::Topic,
                bindings: Vec::new(),
            });

        if let Some(dlx) = &topology.dead_letter_exchange {
            let exchange = inner.exchanges.entry(dlx.clone()).or_insert_with(|| Exchange {
                kind: ExchangeKind::Fanout,
                bindings: Vec::new(),
            });
            if let Some(dlq) = &topology.dead_letter_queue {
                let binding = (dlq.clone(), String::new());
                if !exchange.bindings.contains(&binding) {
                    exchange.bindings.push(binding);
                }
                inner.queues.entry(dlq.clone()).or_default();
            }
        }

        let queue = inner.queues.entry(topology.queue.clone()).or_default();
        queue.dead_letter_exchange = topology.dead_letter_exchange.clone();

        let binding = (topology.queue.clone(), topology.binding_key.clone());
        if let Some(exchange) = inner.exchanges.get_mut(&topology.exchange) {
            if !exchange.bindings.contains(&binding) {
                exchange.bindings.push(binding);
            }
        }
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, topology: &Topology) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        if !self.broker.is_available() {
            return Err(BrokerError::Unreachable("in-memory broker offline".to_string()));
        }
        self.broker.declare(topology);
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemorySession {
            state: self.broker.state.clone(),
            generation: self.broker.state.current_generation(),
            closed,
        }))
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    generation: u64,
    closed: watch::Sender<bool>,
}

impl MemorySession {
    fn severed(&self) -> bool {
        self.state.current_generation() != self.generation || *self.closed.borrow()
    }

    async fn wait_severed(&self) -> &'static str {
        let mut generation_rx = self.state.generation.subscribe();
        let mut closed_rx = self.closed.subscribe();
        let generation = self.generation;
        tokio::select! {
            _ = async { let _ = generation_rx.wait_for(|g| *g != generation).await; } => "connection severed",
            _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => "closed by client",
        }
    }
}

#[async_trait::async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), BrokerError> {
        self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.severed() {
            return Err(BrokerError::Disconnected);
        }
        if self.state.stall_publishes.load(Ordering::SeqCst) {
            self.wait_severed().await;
            return Err(BrokerError::Disconnected);
        }
        let failing = self
            .state
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Nacked(message.message_id.clone()));
        }

        let stored = StoredMessage {
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            message_id: message.message_id.clone(),
            redelivered: false,
        };
        let routed = self.state.inner.lock().route(exchange, stored)?;
        if routed == 0 {
            debug!("Message {} matched no binding", message.message_id);
        }
        self.state.changed.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        if self.severed() {
            return Err(BrokerError::Disconnected);
        }
        if !self.state.inner.lock().queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("no queue {}", queue)));
        }

        let cursor = ConsumerCursor {
            state: self.state.clone(),
            queue: queue.to_string(),
            generation: self.generation,
            closed: self.closed.subscribe(),
            prefetch: usize::from(prefetch.max(1)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };

        Ok(futures_util::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok::<_, BrokerError>(delivery), cursor))
        })
        .boxed())
    }

    async fn closed(&self) -> String {
        self.wait_severed().await.to_string()
    }

    fn is_open(&self) -> bool {
        !self.severed() && self.state.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.send_replace(true);
        self.state.changed.notify_waiters();
        Ok(())
    }
}

struct ConsumerCursor {
    state: Arc<BrokerState>,
    queue: String,
    generation: u64,
    closed: watch::Receiver<bool>,
    prefetch: usize,
    in_flight: Arc<AtomicUsize>,
}

impl ConsumerCursor {
    fn live(&self) -> bool {
        self.state.current_generation() == self.generation && !*self.closed.borrow()
    }

    /// `None` once the session is gone.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.live() {
                return None;
            }
            if self.in_flight.load(Ordering::SeqCst) < self.prefetch {
                if let Some(delivery) = self.take_ready() {
                    return Some(delivery);
                }
            }
            notified.await;
        }
    }

    fn take_ready(&self) -> Option<Delivery> {
        let mut inner = self.state.inner.lock();
        inner.next_tag += 1;
        let tag = inner.next_tag;
        let queue = inner.queues.get_mut(&self.queue)?;
        let message = queue.ready.pop_front()?;
        queue.unacked.insert(tag, message.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        Some(Delivery {
            body: message.body,
            headers: message.headers,
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                state: self.state.clone(),
                queue: self.queue.clone(),
                tag,
                in_flight: self.in_flight.clone(),
                settled: AtomicBool::new(false),
            }),
        })
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    tag: u64,
    in_flight: Arc<AtomicUsize>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<StoredMessage, BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Topology(format!(
                "delivery {} already settled",
                self.tag
            )));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut inner = self.state.inner.lock();
        inner
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or(BrokerError::Disconnected)
    }
}

#[async_trait::async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let result = self.settle().map(|_| ());
        self.state.changed.notify_waiters();
        result
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let result = self.settle().map(|mut message| {
            let mut inner = self.state.inner.lock();
            if requeue {
                message.redelivered = true;
                if let Some(queue) = inner.queues.get_mut(&self.queue) {
                    queue.ready.push_front(message);
                }
            } else {
                inner.dead_letter(&self.queue, message);
            }
        });
        self.state.changed.notify_waiters();
        result
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topology() -> Topology {
        Topology::new("sync", "tasks").with_dead_letter("sync_dlx")
    }

    fn message(routing_key: &str, id: &str) -> OutgoingMessage {
        OutgoingMessage {
            routing_key: routing_key.to_string(),
            body: id.as_bytes().to_vec(),
            headers: BTreeMap::new(),
            message_id: id.to_string(),
            content_type: "application/json",
            persistent: true,
        }
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("#", "species.eu"));
        assert!(topic_matches("species.*", "species.eu"));
        assert!(!topic_matches("species.*", "fossil.eu"));
        assert!(!topic_matches("*", "species.eu"));
        assert!(topic_matches("*.eu", "fossil.eu"));
        assert!(topic_matches("species.#", "species"));
        assert!(topic_matches("#.eu", "a.b.eu"));
        assert!(!topic_matches("species.eu", "species.us"));
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding_key() {
        let broker = MemoryBroker::new();
        let mut topology = topology();
        topology.binding_key = "species.*".to_string();
        let session = broker.connector().connect(&topology).await.unwrap();

        session.publish("sync", &message("species.eu", "a")).await.unwrap();
        session.publish("sync", &message("fossil.eu", "b")).await.unwrap();

        let ready = broker.ready_messages("tasks");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "a");
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let session = broker.connector().connect(&topology()).await.unwrap();
        for id in ["a", "b", "c"] {
            session.publish("sync", &message("species.eu", id)).await.unwrap();
        }

        let mut stream = session.consume("tasks", "test", 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        first.acker.ack().await.unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.body, b"c".to_vec());
    }

    #[tokio::test]
    async fn test_nack_requeues_then_dead_letters() {
        let broker = MemoryBroker::new();
        let session = broker.connector().connect(&topology()).await.unwrap();
        session.publish("sync", &message("species.eu", "a")).await.unwrap();

        let mut stream = session.consume("tasks", "test", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        delivery.acker.nack(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        again.acker.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("tasks"), 0);
        assert_eq!(broker.queue_depth("sync_dlx.queue"), 1);
        assert_eq!(broker.dead_letters()[0].message_id, "a");
    }

    #[tokio::test]
    async fn test_sever_returns_unacked_and_ends_stream() {
        let broker = MemoryBroker::new();
        let session = broker.connector().connect(&topology()).await.unwrap();
        session.publish("sync", &message("species.eu", "a")).await.unwrap();

        let mut stream = session.consume("tasks", "test", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.sever_connections();
        assert!(stream.next().await.is_none());
        assert!(!session.is_open());
        assert!(matches!(
            delivery.acker.ack().await,
            Err(BrokerError::Disconnected)
        ));
        assert!(broker.ready_messages("tasks")[0].redelivered);

        let closed = tokio::time::timeout(Duration::from_millis(50), session.closed()).await;
        assert_eq!(closed.unwrap(), "connection severed");
    }

    #[tokio::test]
    async fn test_connect_fails_while_offline() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.connector().connect(&topology()).await,
            Err(BrokerError::Unreachable(_))
        ));
    }
}
