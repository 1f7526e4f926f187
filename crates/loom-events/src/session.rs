// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session state machine.
//!
//! Tracks `(session_id, last_event_id, last_event_time)`, stamps incoming
//! events and synthesizes `session_start`/`session_end` markers when the gap
//! between events exceeds the configured threshold. Every mutation is
//! persisted; a persistence failure is logged and the in-memory value still
//! advances.

use std::sync::Arc;

use loom_events_core::constants::{SESSION_END_EVENT, SESSION_START_EVENT};
use loom_events_core::Event;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::storage::{Storage, StorageKey};

/// Session id readable from outside the worker.
pub(crate) type SharedSessionId = Arc<Mutex<i64>>;

pub(crate) fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

pub(crate) struct SessionManager {
	storage: Arc<dyn Storage>,
	min_time_between_sessions_millis: i64,
	track_session_events: bool,
	session_id: SharedSessionId,
	last_event_id: i64,
	last_event_time: i64,
}

impl SessionManager {
	/// Restores state persisted by a previous instance.
	pub fn load(
		storage: Arc<dyn Storage>,
		min_time_between_sessions_millis: i64,
		track_session_events: bool,
	) -> Self {
		let session_id = storage.read_i64(StorageKey::PreviousSessionId).unwrap_or(-1);
		let last_event_id = storage.read_i64(StorageKey::LastEventId).unwrap_or(0);
		let last_event_time = storage.read_i64(StorageKey::LastEventTime).unwrap_or(-1);
		debug!(session_id, last_event_id, last_event_time, "Loaded session state");
		Self {
			storage,
			min_time_between_sessions_millis,
			track_session_events,
			session_id: Arc::new(Mutex::new(session_id)),
			last_event_id,
			last_event_time,
		}
	}

	pub fn session_id(&self) -> i64 {
		*self.session_id.lock()
	}

	pub fn shared_session_id(&self) -> SharedSessionId {
		self.session_id.clone()
	}

	pub fn last_event_id(&self) -> i64 {
		self.last_event_id
	}

	pub fn last_event_time(&self) -> i64 {
		self.last_event_time
	}

	/// Stamps `event` and returns the events to emit, synthesized markers
	/// first. A dummy `session_start` (no session id) is consumed here.
	pub fn process_event(&mut self, mut event: Event, in_foreground: bool) -> Vec<Event> {
		let timestamp = *event.timestamp.get_or_insert_with(now_millis);
		let mut skip = false;
		let mut emitted = Vec::new();

		if event.event_type == SESSION_START_EVENT {
			match event.session_id {
				None => {
					skip = true;
					emitted = self.start_new_session_if_needed(timestamp, in_foreground);
				}
				Some(session_id) => {
					self.set_session_id(session_id);
					self.set_last_event_time(timestamp);
				}
			}
		} else if event.event_type != SESSION_END_EVENT {
			emitted = self.start_new_session_if_needed(timestamp, in_foreground);
		}

		if !skip {
			if event.session_id.is_none() {
				event.session_id = Some(self.session_id());
			}
			emitted.push(event);
		}

		self.assign_event_ids(&mut emitted);
		emitted
	}

	/// Extends the current session, or starts a new one when the gap since
	/// the last event is too large and the app is not in the foreground.
	pub fn start_new_session_if_needed(&mut self, timestamp: i64, in_foreground: bool) -> Vec<Event> {
		let within_gap =
			timestamp - self.last_event_time < self.min_time_between_sessions_millis;
		if self.session_id() >= 0 && (in_foreground || within_gap) {
			self.set_last_event_time(timestamp);
			return Vec::new();
		}
		self.start_new_session(timestamp)
	}

	pub fn start_new_session(&mut self, timestamp: i64) -> Vec<Event> {
		let mut markers = Vec::new();
		if let Some(end) = self.session_end_marker() {
			markers.push(end);
		}

		debug!(session_id = timestamp, "Starting session");
		self.set_session_id(timestamp);
		self.set_last_event_time(timestamp);

		if self.track_session_events {
			markers.push(
				Event::new(SESSION_START_EVENT)
					.with_timestamp(timestamp)
					.with_session_id(timestamp),
			);
		}
		markers
	}

	pub fn end_current_session(&mut self) -> Vec<Event> {
		let markers: Vec<Event> = self.session_end_marker().into_iter().collect();
		debug!(session_id = self.session_id(), "Ending session");
		self.set_session_id(-1);
		markers
	}

	pub fn set_last_event_time(&mut self, timestamp: i64) {
		self.last_event_time = timestamp;
		self.persist(StorageKey::LastEventTime, timestamp);
	}

	/// Ids are assigned only to events that do not carry one; the high-water
	/// mark is persisted once per call.
	pub fn assign_event_ids(&mut self, events: &mut [Event]) {
		let mut last = self.last_event_id;
		for event in events.iter_mut().filter(|e| e.event_id.is_none()) {
			last += 1;
			event.event_id = Some(last);
		}
		if last != self.last_event_id {
			self.last_event_id = last;
			self.persist(StorageKey::LastEventId, last);
		}
	}

	fn session_end_marker(&self) -> Option<Event> {
		let session_id = self.session_id();
		if !self.track_session_events || session_id < 0 {
			return None;
		}
		let mut end = Event::new(SESSION_END_EVENT).with_session_id(session_id);
		if self.last_event_time > 0 {
			end.timestamp = Some(self.last_event_time);
		}
		Some(end)
	}

	fn set_session_id(&mut self, session_id: i64) {
		*self.session_id.lock() = session_id;
		self.persist(StorageKey::PreviousSessionId, session_id);
	}

	fn persist(&self, key: StorageKey, value: i64) {
		if let Err(e) = self.storage.write(key, Some(json!(value))) {
			warn!(key = key.as_str(), error = %e, "Failed to persist session state");
		}
	}
}
