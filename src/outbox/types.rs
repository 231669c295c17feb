//! Types for pending local mutations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of mutation recorded on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// Entity families that take part in synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Species,
    Fossil,
    Collection,
}

impl EntityType {
    /// Name used in routing keys and message headers
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Species => "species",
            EntityType::Fossil => "fossil",
            EntityType::Collection => "collection",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "species" => Ok(EntityType::Species),
            "fossil" => Ok(EntityType::Fossil),
            "collection" => Ok(EntityType::Collection),
            other => Err(format!("invalid entity type: {}", other)),
        }
    }
}

/// A mutation made on this device that the backend has not yet acknowledged.
///
/// The payload is an opaque snapshot of the entity; it is never inspected by the
/// sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Globally unique operation id, also used as the idempotency key downstream.
    pub id: Uuid,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Creation time on the device.
    pub timestamp: DateTime<Utc>,
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Clock counter assigned when the operation was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl SyncOperation {
    pub fn new(
        operation_type: OperationType,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
        priority: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            timestamp: Utc::now(),
            priority,
            version: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Dispatch order: priority descending, then oldest first.
///
/// The id is a final tie-break so that the order is total and stable across reads.
pub fn dispatch_order(a: &SyncOperation, b: &SyncOperation) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

/// Serde adapter that carries opaque bytes as a base64 string.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Errors raised by the pending-operation store
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Failed to persist operation {id}: {source}")]
    Persist {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove confirmed operation {id}: {source}")]
    Remove {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read pending operations from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
