//! Wire encoding of WireRecords.
//!
//! The body is the JSON form of the SyncOperation; routing metadata travels in
//! headers so that the body stays identical to what the backend stores.

use crate::broker::types::{HeaderValue, WireRecord};
use crate::outbox::{EntityType, SyncOperation};
use std::collections::BTreeMap;

pub const HEADER_REGION: &str = "region";
pub const HEADER_ENTITY_TYPE: &str = "entity_type";
pub const HEADER_VERSION: &str = "version";
pub const HEADER_DEVICE_ID: &str = "device_id";

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid message body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("Missing header {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },
}

/// A message ready to hand to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub message_id: String,
    pub content_type: &'static str,
    pub persistent: bool,
}

pub fn encode(record: &WireRecord) -> Result<OutgoingMessage, CodecError> {
    let version = i64::try_from(record.version).map_err(|_| CodecError::InvalidHeader {
        name: HEADER_VERSION,
        reason: format!("{} does not fit in i64", record.version),
    })?;

    let mut headers = BTreeMap::new();
    headers.insert(
        HEADER_REGION.to_string(),
        HeaderValue::Text(record.region.clone()),
    );
    headers.insert(
        HEADER_ENTITY_TYPE.to_string(),
        HeaderValue::Text(record.operation.entity_type.to_string()),
    );
    headers.insert(HEADER_VERSION.to_string(), HeaderValue::Int(version));
    headers.insert(
        HEADER_DEVICE_ID.to_string(),
        HeaderValue::Text(record.device_id.clone()),
    );

    Ok(OutgoingMessage {
        routing_key: record.routing_key(),
        body: serde_json::to_vec(&record.operation)?,
        headers,
        message_id: record.operation.id.to_string(),
        content_type: CONTENT_TYPE_JSON,
        persistent: true,
    })
}

pub fn decode(
    body: &[u8],
    headers: &BTreeMap<String, HeaderValue>,
) -> Result<WireRecord, CodecError> {
    let operation: SyncOperation = serde_json::from_slice(body)?;

    let text_header = |name: &'static str| -> Result<String, CodecError> {
        headers
            .get(name)
            .ok_or(CodecError::MissingHeader(name))?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| CodecError::InvalidHeader {
                name,
                reason: "expected a string".to_string(),
            })
    };

    let region = text_header(HEADER_REGION)?;
    let device_id = text_header(HEADER_DEVICE_ID)?;
    let entity_type: EntityType =
        text_header(HEADER_ENTITY_TYPE)?
            .parse()
            .map_err(|reason| CodecError::InvalidHeader {
                name: HEADER_ENTITY_TYPE,
                reason,
            })?;
    if entity_type != operation.entity_type {
        return Err(CodecError::InvalidHeader {
            name: HEADER_ENTITY_TYPE,
            reason: format!(
                "header says {} but body says {}",
                entity_type, operation.entity_type
            ),
        });
    }

    let version = headers
        .get(HEADER_VERSION)
        .ok_or(CodecError::MissingHeader(HEADER_VERSION))?
        .as_int()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| CodecError::InvalidHeader {
            name: HEADER_VERSION,
            reason: "expected a non-negative integer".to_string(),
        })?;

    Ok(WireRecord {
        operation,
        region,
        version,
        device_id,
    })
}
