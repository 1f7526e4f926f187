// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The event wire model.
//!
//! An [`Event`] serializes to exactly the object the collection endpoint
//! expects inside the `events` array of an upload. Fields that only matter
//! locally (the attempt counter and the completion callback) are skipped.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::constants::{
	GROUP_IDENTIFY_EVENT, IDENTIFY_EVENT, REVENUE_EVENT, SESSION_END_EVENT, SESSION_START_EVENT,
};
use crate::identify::IdentifyOperation;

/// A JSON object of arbitrary properties.
pub type Properties = serde_json::Map<String, Value>;

/// Completion callback fired once an event reaches a terminal disposition.
///
/// Arguments are the event, the HTTP status code and a human-readable message.
#[derive(Clone)]
pub struct EventCallback(Arc<dyn Fn(&Event, u16, &str) + Send + Sync>);

impl EventCallback {
	pub fn new<F>(f: F) -> Self
	where
		F: Fn(&Event, u16, &str) + Send + Sync + 'static,
	{
		Self(Arc::new(f))
	}

	pub fn call(&self, event: &Event, code: u16, message: &str) {
		(self.0)(event, code, message)
	}
}

impl fmt::Debug for EventCallback {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("EventCallback(..)")
	}
}

impl PartialEq for EventCallback {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

/// Tracking plan the event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub branch: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, rename = "versionId", skip_serializing_if = "Option::is_none")]
	pub version_id: Option<String>,
}

/// Identifies the pipeline that ingested the event, when it is not this SDK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_version: Option<String>,
}

/// The kind of an event, derived from its type tag.
///
/// Plugins that want per-kind handling dispatch on this instead of inspecting
/// the event type string themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	Track,
	Identify,
	GroupIdentify,
	Revenue,
}

/// A single analytics event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
	pub event_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_properties: Option<Properties>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_properties: Option<Properties>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub groups: Option<Properties>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group_properties: Option<Properties>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device_id: Option<String>,
	/// Epoch milliseconds.
	#[serde(default, rename = "time", skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_id: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub insert_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location_lat: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub location_lng: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub os_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub os_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device_brand: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device_manufacturer: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device_model: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub carrier: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub country: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub city: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dma: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub library: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub partner_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plan: Option<Plan>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ingestion_metadata: Option<IngestionMetadata>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub revenue: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub price: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quantity: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub product_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub revenue_type: Option<String>,

	/// Number of times this event has been handed to the pipeline.
	#[serde(skip)]
	pub attempts: u32,
	#[serde(skip)]
	pub callback: Option<EventCallback>,
}

/// A persisted block could not be decoded.
#[derive(Debug, Error)]
#[error("malformed event block: {0}")]
pub struct EventDecodeError(#[from] serde_json::Error);

impl Event {
	/// Creates an event of the given type with every other field unset.
	pub fn new(event_type: impl Into<String>) -> Self {
		Self {
			event_type: event_type.into(),
			..Default::default()
		}
	}

	pub fn with_event_properties(mut self, properties: Properties) -> Self {
		self.event_properties = Some(properties);
		self
	}

	pub fn with_user_properties(mut self, properties: Properties) -> Self {
		self.user_properties = Some(properties);
		self
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
		self.device_id = Some(device_id.into());
		self
	}

	pub fn with_timestamp(mut self, timestamp: i64) -> Self {
		self.timestamp = Some(timestamp);
		self
	}

	pub fn with_session_id(mut self, session_id: i64) -> Self {
		self.session_id = Some(session_id);
		self
	}

	pub fn with_insert_id(mut self, insert_id: impl Into<String>) -> Self {
		self.insert_id = Some(insert_id.into());
		self
	}

	pub fn with_callback(mut self, callback: EventCallback) -> Self {
		self.callback = Some(callback);
		self
	}

	pub fn kind(&self) -> EventKind {
		match self.event_type.as_str() {
			IDENTIFY_EVENT => EventKind::Identify,
			GROUP_IDENTIFY_EVENT => EventKind::GroupIdentify,
			REVENUE_EVENT => EventKind::Revenue,
			_ => EventKind::Track,
		}
	}

	/// An event can be delivered only when it is attributable to someone.
	pub fn is_valid(&self) -> bool {
		self.user_id.is_some() || self.device_id.is_some()
	}

	pub fn is_session_start(&self) -> bool {
		self.event_type == SESSION_START_EVENT
	}

	pub fn is_session_end(&self) -> bool {
		self.event_type == SESSION_END_EVENT
	}

	/// Returns the value of one identify operation inside `user_properties`.
	pub fn user_operation(&self, op: IdentifyOperation) -> Option<&Value> {
		self.user_properties.as_ref()?.get(op.as_str())
	}

	/// Decodes a persisted block: a JSON array of events.
	pub fn parse_array(raw: &str) -> Result<Vec<Event>, EventDecodeError> {
		Ok(serde_json::from_str(raw)?)
	}

	/// Encodes events as a JSON array, the on-disk and on-wire block format.
	pub fn to_array_string(events: &[Event]) -> serde_json::Result<String> {
		serde_json::to_string(events)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;
	use std::sync::atomic::{AtomicU16, Ordering};

	#[test]
	fn serializes_with_wire_names() {
		let event = Event::new("click")
			.with_user_id("u1")
			.with_timestamp(1000)
			.with_session_id(900)
			.with_insert_id("abc");
		let value = serde_json::to_value(&event).unwrap();
		assert_eq!(value["event_type"], "click");
		assert_eq!(value["user_id"], "u1");
		assert_eq!(value["time"], 1000);
		assert_eq!(value["session_id"], 900);
		assert_eq!(value["insert_id"], "abc");
		assert!(value.get("device_id").is_none());
		assert!(value.get("attempts").is_none());
		assert!(value.get("callback").is_none());
	}

	#[test]
	fn plan_uses_camel_case_version_id() {
		let plan = Plan {
			version_id: Some("v9".to_string()),
			..Default::default()
		};
		let value = serde_json::to_value(&plan).unwrap();
		assert_eq!(value, json!({"versionId": "v9"}));
	}

	#[test]
	fn kind_follows_event_type() {
		assert_eq!(Event::new("$identify").kind(), EventKind::Identify);
		assert_eq!(Event::new("$groupidentify").kind(), EventKind::GroupIdentify);
		assert_eq!(Event::new("revenue_amount").kind(), EventKind::Revenue);
		assert_eq!(Event::new("session_start").kind(), EventKind::Track);
		assert_eq!(Event::new("purchase").kind(), EventKind::Track);
	}

	#[test]
	fn validity_requires_an_identity() {
		assert!(!Event::new("a").is_valid());
		assert!(Event::new("a").with_user_id("u").is_valid());
		assert!(Event::new("a").with_device_id("d").is_valid());
	}

	#[test]
	fn parse_array_rejects_truncated_block() {
		assert!(Event::parse_array(r#"[{"event_type":"a"},{"event_t"#).is_err());
	}

	#[test]
	fn parse_array_ignores_unknown_fields() {
		let events =
			Event::parse_array(r#"[{"event_type":"a","user_id":"u","some_future_field":1}]"#)
				.unwrap();
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].user_id.as_deref(), Some("u"));
	}

	#[test]
	fn callback_is_invoked_with_code() {
		let seen = Arc::new(AtomicU16::new(0));
		let seen_cb = seen.clone();
		let callback = EventCallback::new(move |_, code, _| {
			seen_cb.store(code, Ordering::SeqCst);
		});
		let event = Event::new("a").with_callback(callback.clone());
		callback.call(&event, 200, "ok");
		assert_eq!(seen.load(Ordering::SeqCst), 200);
		assert_eq!(event.callback, Some(callback));
	}

	proptest! {
		#[test]
		fn block_encoding_preserves_order(types in proptest::collection::vec("[a-z_]{1,12}", 0..20)) {
			let events: Vec<Event> = types.iter().map(Event::new).collect();
			let raw = Event::to_array_string(&events).unwrap();
			let decoded = Event::parse_array(&raw).unwrap();
			let decoded_types: Vec<String> = decoded.into_iter().map(|e| e.event_type).collect();
			prop_assert_eq!(decoded_types, types);
		}
	}
}
