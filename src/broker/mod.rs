//! Message broker integration.
//!
//! - `client`: connection lifecycle, reconnection monitor, publish through the circuit breaker, consume.
//! - `consumer`: batching of received deliveries and the record handlers applied to them.
//! - `circuit_breaker`: the closed / open / half-open guard in front of publishes.
//! - `codec`: the JSON body and header layout of a published record.
//! - `transport`: the seam to a concrete broker, implemented by `amqp` and `memory`.

/// AMQP transport
pub mod amqp;
/// Broker client and reconnection monitor
pub mod client;
pub mod circuit_breaker;
pub mod codec;
/// Batch consumer and record handlers
pub mod consumer;
/// In-process broker
pub mod memory;
pub mod transport;
pub mod types;

pub use amqp::AmqpConnector;
pub use client::{BrokerClient, BrokerConfig, ConsumerHandle};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use consumer::{
    BatchConfig, BatchConsumer, FlushReport, FlushTrigger, HandlerError, IdempotentHandler,
    RecordHandler, StoreApplier,
};
pub use memory::MemoryBroker;
pub use transport::{BrokerConnector, BrokerSession, Topology};
pub use types::{BrokerError, DeliveryState, WireRecord};
