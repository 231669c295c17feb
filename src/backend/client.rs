//!
//! HTTP client for the backend sync API.
//!
//! `POST /sync` accepts a batch of operations and answers with the ids it stored;
//! `GET /collections` pages through changes made by other devices.

use super::types::*;
use crate::outbox::SyncOperation;
use crate::sync::clock::ClockStamp;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of changes made on other devices
#[async_trait::async_trait]
pub trait RemoteChangeSource: Send + Sync {
	/// Fetch one page of changes newer than `since`. Pages start at 1.
	async fn fetch_page(
		&self,
		since: Option<DateTime<Utc>>,
		page: u32,
		limit: u32,
	) -> Result<ChangePage, BackendError>;
}

/// Direct upload path that bypasses the broker
#[async_trait::async_trait]
pub trait OperationUploader: Send + Sync {
	/// Upload operations and return the ids the backend accepted.
	async fn upload(
		&self,
		operations: &[SyncOperation],
		stamp: &ClockStamp,
	) -> Result<Vec<Uuid>, BackendError>;
}

/// Backend sync API client
#[derive(Clone)]
pub struct BackendClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL without trailing slash, e.g. `https://api.example.org/v1`.
	base_url: String,
}

impl BackendClient {
	/// Create a new backend client.
	///
	/// # Arguments
	/// * `base_url` - Base URL of the sync API.
	/// * `timeout` - Per-request timeout.
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
		let http_client = Client::builder().timeout(timeout).build()?;
		let base_url = base_url.into().trim_end_matches('/').to_string();

		Ok(Self {
			http_client,
			base_url,
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	async fn check_status(response: Response) -> Result<Response, BackendError> {
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		let body = response.text().await.unwrap_or_default();
		Err(BackendError::Status {
			status: status.as_u16(),
			body,
		})
	}
}

#[async_trait::async_trait]
impl OperationUploader for BackendClient {
	async fn upload(
		&self,
		operations: &[SyncOperation],
		stamp: &ClockStamp,
	) -> Result<Vec<Uuid>, BackendError> {
		let request_body = UploadRequest {
			device_id: &stamp.device_id,
			version: stamp.counter,
			operations,
		};

		let response = self
			.http_client
			.post(format!("{}/sync", self.base_url))
			.json(&request_body)
			.send()
			.await?;
		let response = Self::check_status(response).await?;
		let body: UploadResponse = serde_json::from_slice(&response.bytes().await?)?;

		info!(
			"Backend accepted {} of {} operations",
			body.accepted.len(),
			operations.len()
		);
		Ok(body.accepted)
	}
}

#[async_trait::async_trait]
impl RemoteChangeSource for BackendClient {
	async fn fetch_page(
		&self,
		since: Option<DateTime<Utc>>,
		page: u32,
		limit: u32,
	) -> Result<ChangePage, BackendError> {
		let mut query = vec![("page", page.to_string()), ("limit", limit.to_string())];
		if let Some(since) = since {
			query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
		}

		let response = self
			.http_client
			.get(format!("{}/collections", self.base_url))
			.query(&query)
			.send()
			.await?;
		let response = Self::check_status(response).await?;
		let page_body: ChangePage = serde_json::from_slice(&response.bytes().await?)?;

		debug!(
			"Fetched page {} with {} changes (more: {})",
			page,
			page_body.items.len(),
			page_body.has_more
		);
		Ok(page_body)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::outbox::{EntityType, OperationType};
	use chrono::TimeZone;
	use mockito::Matcher;
	use serde_json::json;

	fn make_operation() -> SyncOperation {
		SyncOperation::new(
			OperationType::Delete,
			EntityType::Fossil,
			"fossil-3",
			Vec::new(),
			1,
		)
	}

	#[tokio::test]
	async fn test_upload_returns_accepted_ids() {
		let mut server = mockito::Server::new_async().await;
		let operation = make_operation();
		let mock = server
			.mock("POST", "/sync")
			.match_body(Matcher::PartialJson(json!({
				"device_id": "device-a",
				"version": 4,
				"operations": [{ "id": operation.id, "type": "delete", "entity_type": "fossil" }]
			})))
			.with_status(200)
			.with_header("content-type", "application/json")
			.with_body(json!({ "accepted": [operation.id] }).to_string())
			.create_async()
			.await;

		let client = BackendClient::new(server.url(), Duration::from_secs(5)).unwrap();
		let accepted = client
			.upload(&[operation.clone()], &ClockStamp::new(4, "device-a"))
			.await
			.unwrap();

		assert_eq!(accepted, vec![operation.id]);
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn test_upload_error_status() {
		let mut server = mockito::Server::new_async().await;
		let _mock = server
			.mock("POST", "/sync")
			.with_status(503)
			.with_body("maintenance")
			.create_async()
			.await;

		let client = BackendClient::new(format!("{}/", server.url()), Duration::from_secs(5)).unwrap();
		let err = client
			.upload(&[make_operation()], &ClockStamp::new(1, "device-a"))
			.await
			.unwrap_err();

		match err {
			BackendError::Status { status, body } => {
				assert_eq!(status, 503);
				assert_eq!(body, "maintenance");
			}
			other => panic!("unexpected error: {}", other),
		}
	}

	#[tokio::test]
	async fn test_fetch_page_sends_watermark() {
		let mut server = mockito::Server::new_async().await;
		let since = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
		let mock = server
			.mock("GET", "/collections")
			.match_query(Matcher::AllOf(vec![
				Matcher::UrlEncoded("page".into(), "2".into()),
				Matcher::UrlEncoded("limit".into(), "50".into()),
				Matcher::UrlEncoded("since".into(), "2024-05-01T10:00:00.000Z".into()),
			]))
			.with_status(200)
			.with_header("content-type", "application/json")
			.with_body(json!({ "items": [{ "id": "x" }], "has_more": true }).to_string())
			.create_async()
			.await;

		let client = BackendClient::new(server.url(), Duration::from_secs(5)).unwrap();
		let page = client.fetch_page(Some(since), 2, 50).await.unwrap();

		assert_eq!(page.items.len(), 1);
		assert!(page.has_more);
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn test_fetch_page_without_watermark() {
		let mut server = mockito::Server::new_async().await;
		let _mock = server
			.mock("GET", "/collections")
			.match_query(Matcher::AllOf(vec![
				Matcher::UrlEncoded("page".into(), "1".into()),
				Matcher::UrlEncoded("limit".into(), "100".into()),
			]))
			.with_status(200)
			.with_body("{}")
			.create_async()
			.await;

		let client = BackendClient::new(server.url(), Duration::from_secs(5)).unwrap();
		let page = client.fetch_page(None, 1, 100).await.unwrap();
		assert!(page.items.is_empty());
		assert!(!page.has_more);
	}
}
