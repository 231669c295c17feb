//! Request and response bodies of the backend sync API

use crate::outbox::SyncOperation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /sync`
#[derive(Debug, Serialize)]
pub struct UploadRequest<'a> {
    pub device_id: &'a str,
    /// Clock counter of the uploading device.
    pub version: u64,
    pub operations: &'a [SyncOperation],
}

/// Response of `POST /sync`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponse {
    /// Operation ids the backend durably stored.
    #[serde(default)]
    pub accepted: Vec<Uuid>,
}

/// One page of `GET /collections`.
///
/// Items stay raw so that a single malformed record does not fail the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangePage {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
