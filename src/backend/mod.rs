//! Backend sync API integration
//!
//! The backend is reached over HTTP for two things: pulling changes made on other
//! devices, and uploading operations directly when the broker path is not used.

/// HTTP client for the sync API
mod client;
/// Request and response types
mod types;

pub use client::{BackendClient, OperationUploader, RemoteChangeSource};
pub use types::*;
