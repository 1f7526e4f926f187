// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP transport for event blocks.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::diagnostics::{Diagnostics, SdkDiagnostics};
use crate::error::{Result, SendError};
use crate::pipeline::BatchSender;

#[derive(Serialize)]
struct UploadRequest<'a> {
	api_key: &'a str,
	client_upload_time: String,
	events: &'a RawValue,
	#[serde(skip_serializing_if = "Option::is_none")]
	options: Option<UploadOptions>,
	#[serde(skip_serializing_if = "Option::is_none")]
	request_metadata: Option<RequestMetadata>,
}

#[derive(Serialize)]
struct UploadOptions {
	min_id_length: u32,
}

#[derive(Serialize)]
struct RequestMetadata {
	sdk: SdkDiagnostics,
}

/// Posts serialized blocks to the collection endpoint.
pub struct HttpClient {
	client: Client,
	url: String,
	api_key: String,
	min_id_length: Option<u32>,
	diagnostics: Arc<Diagnostics>,
}

impl HttpClient {
	pub(crate) fn new(config: &Configuration, diagnostics: Arc<Diagnostics>) -> Result<Self> {
		let client = loom_common_http::builder()
			.timeout(config.request_timeout)
			.build()?;
		Ok(Self {
			client,
			url: config.server_url().to_string(),
			api_key: config.api_key.clone(),
			min_id_length: config.min_id_length,
			diagnostics,
		})
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	fn encode(&self, events: &str) -> std::result::Result<Vec<u8>, SendError> {
		let events: &RawValue = serde_json::from_str(events)
			.map_err(|e| SendError::InvalidPayload(e.to_string()))?;
		let request = UploadRequest {
			api_key: &self.api_key,
			client_upload_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
			events,
			options: self
				.min_id_length
				.map(|min_id_length| UploadOptions { min_id_length }),
			request_metadata: self
				.diagnostics
				.extract()
				.map(|sdk| RequestMetadata { sdk }),
		};
		serde_json::to_vec(&request).map_err(|e| SendError::InvalidPayload(e.to_string()))
	}
}

#[async_trait::async_trait]
impl BatchSender for HttpClient {
	async fn send_batch(&self, events: &str) -> std::result::Result<u16, SendError> {
		let body = self.encode(events)?;

		let response = match self
			.client
			.post(&self.url)
			.header(CONTENT_TYPE, "application/json; charset=utf-8")
			.header(ACCEPT, "application/json")
			.body(body)
			.send()
			.await
		{
			Ok(response) => response,
			Err(e) => {
				warn!(error = %e, url = %self.url, "Event upload request failed");
				self.diagnostics.add_error_log(format!("upload failed: {e}"));
				return Err(SendError::Transport(e));
			}
		};

		let status = response.status().as_u16();
		if (1..300).contains(&status) {
			debug!(status, "Event upload accepted");
			return Ok(status);
		}

		let body = response.text().await.unwrap_or_default();
		debug!(status, body = %body, "Event upload rejected");
		Err(SendError::Status { status, body })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::{json, Value};
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, Request, ResponseTemplate};

	fn client_for(server: &MockServer, min_id_length: Option<u32>) -> HttpClient {
		let mut builder = Configuration::builder("test-key").server_url(format!("{}/2/httpapi", server.uri()));
		if let Some(len) = min_id_length {
			builder = builder.min_id_length(len);
		}
		HttpClient::new(&builder.build().unwrap(), Arc::new(Diagnostics::default())).unwrap()
	}

	fn body_of(request: &Request) -> Value {
		serde_json::from_slice(&request.body).unwrap()
	}

	#[tokio::test]
	async fn posts_block_with_wire_headers_and_body() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/2/httpapi"))
			.and(header("content-type", "application/json; charset=utf-8"))
			.and(header("accept", "application/json"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let client = client_for(&server, Some(5));
		let status = client
			.send_batch(r#"[{"event_type":"a","user_id":"u"}]"#)
			.await
			.unwrap();
		assert_eq!(status, 200);

		let requests = server.received_requests().await.unwrap();
		let body = body_of(&requests[0]);
		assert_eq!(body["api_key"], "test-key");
		assert_eq!(body["events"], json!([{"event_type": "a", "user_id": "u"}]));
		assert_eq!(body["options"], json!({"min_id_length": 5}));
		assert!(body.get("request_metadata").is_none());
		let upload_time = body["client_upload_time"].as_str().unwrap();
		assert!(chrono::DateTime::parse_from_rfc3339(upload_time).is_ok());
		assert!(upload_time.contains('.'));
	}

	#[tokio::test]
	async fn omits_options_without_min_id_length() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		client_for(&server, None).send_batch("[]").await.unwrap();
		let requests = server.received_requests().await.unwrap();
		assert!(body_of(&requests[0]).get("options").is_none());
	}

	#[tokio::test]
	async fn non_success_status_carries_body() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(413).set_body_string(r#"{"error":"too big"}"#))
			.mount(&server)
			.await;

		let err = client_for(&server, None).send_batch("[]").await.unwrap_err();
		match err {
			SendError::Status { status, body } => {
				assert_eq!(status, 413);
				assert!(body.contains("too big"));
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn attaches_and_clears_diagnostics() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		let client = client_for(&server, None);
		client.diagnostics.add_error_log("earlier failure");
		client.send_batch("[]").await.unwrap();
		client.send_batch("[]").await.unwrap();

		let requests = server.received_requests().await.unwrap();
		assert_eq!(
			body_of(&requests[0])["request_metadata"],
			json!({"sdk": {"error_logs": ["earlier failure"]}})
		);
		assert!(body_of(&requests[1]).get("request_metadata").is_none());
	}

	#[tokio::test]
	async fn invalid_block_is_not_sent() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.expect(0)
			.mount(&server)
			.await;

		let err = client_for(&server, None)
			.send_batch(r#"[{"event_type":"#)
			.await
			.unwrap_err();
		assert!(matches!(err, SendError::InvalidPayload(_)));
	}
}
