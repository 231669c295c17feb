//! Types shared by the broker client, transports and consumer.

use crate::outbox::SyncOperation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A SyncOperation with the routing metadata it is published under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub operation: SyncOperation,
    pub region: String,
    /// Clock counter of the publishing device at send time.
    pub version: u64,
    pub device_id: String,
}

impl WireRecord {
    pub fn new(
        operation: SyncOperation,
        region: impl Into<String>,
        version: u64,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            region: region.into(),
            version,
            device_id: device_id.into(),
        }
    }

    /// `"{entity_type}.{region}"`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.operation.entity_type, self.region)
    }
}

/// Header value carried alongside a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Text(s) => s.parse().ok(),
        }
    }
}

/// Connection state of a broker client, observable through a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed by the owner. Terminal.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Connection lost before the broker confirmed the message")]
    Disconnected,

    #[error("Circuit breaker open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Broker did not confirm within {0:?}")]
    Timeout(Duration),

    #[error("Broker rejected message {0}")]
    Nacked(String),

    #[error("Failed to declare topology: {0}")]
    Topology(String),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::broker::codec::CodecError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Broker client closed")]
    Closed,
}

impl BrokerError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Codec(_) | BrokerError::Closed)
    }
}
