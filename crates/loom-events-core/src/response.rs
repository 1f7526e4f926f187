// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Structured error bodies returned by the collection endpoint.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

const INVALID_API_KEY_PREFIX: &str = "Invalid API key: ";

/// Body of a 400 Bad Request response.
///
/// Index lists refer to positions in the uploaded `events` array.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BadRequestBody {
	pub error: String,
	pub missing_field: Option<String>,
	pub events_with_invalid_fields: HashMap<String, Vec<usize>>,
	pub events_with_missing_fields: HashMap<String, Vec<usize>>,
	pub silenced_events: Vec<usize>,
	pub silenced_devices: Vec<String>,
}

impl BadRequestBody {
	/// Parses a response body, falling back to an empty body with the raw
	/// text as the error message when it is not the structured form.
	pub fn parse(raw: &str) -> Self {
		serde_json::from_str(raw).unwrap_or_else(|_| Self {
			error: raw.to_string(),
			..Default::default()
		})
	}

	/// Indices the server will never accept.
	pub fn drop_indices(&self) -> HashSet<usize> {
		self
			.events_with_invalid_fields
			.values()
			.chain(self.events_with_missing_fields.values())
			.flatten()
			.chain(self.silenced_events.iter())
			.copied()
			.collect()
	}

	pub fn silenced_devices(&self) -> HashSet<&str> {
		self.silenced_devices.iter().map(String::as_str).collect()
	}

	/// True when the server rejected the whole upload because of `api_key`.
	pub fn is_invalid_api_key(&self, api_key: &str) -> bool {
		self
			.error
			.strip_prefix(INVALID_API_KEY_PREFIX)
			.is_some_and(|key| key == api_key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn collects_drop_indices_from_all_lists() {
		let body = BadRequestBody::parse(
			r#"{
				"code": 400,
				"error": "Request missing required field",
				"events_with_invalid_fields": {"time": [0, 3]},
				"events_with_missing_fields": {"event_type": [2]},
				"silenced_events": [3, 5],
				"silenced_devices": ["dev-1"]
			}"#,
		);
		let expected: HashSet<usize> = [0, 2, 3, 5].into_iter().collect();
		assert_eq!(body.drop_indices(), expected);
		assert!(body.silenced_devices().contains("dev-1"));
	}

	#[test]
	fn plain_text_body_becomes_error_message() {
		let body = BadRequestBody::parse("bad things");
		assert_eq!(body.error, "bad things");
		assert!(body.drop_indices().is_empty());
	}

	#[test]
	fn detects_invalid_api_key_for_this_key_only() {
		let body = BadRequestBody::parse(r#"{"error": "Invalid API key: abc"}"#);
		assert!(body.is_invalid_api_key("abc"));
		assert!(!body.is_invalid_api_key("xyz"));
	}
}
