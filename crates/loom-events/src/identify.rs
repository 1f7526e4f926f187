// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identify interceptor.
//!
//! Bursts of `$set`-only identify events are parked in a dedicated storage
//! instead of being uploaded one by one. The parked entries are merged into a
//! single `$set` and leave either attached to the next event that is not
//! parked, or as one combined identify when the batch timer fires or the
//! active identity changes.

use std::sync::Arc;
use std::time::Duration;

use loom_events_core::constants::IDENTIFY_EVENT;
use loom_events_core::{Event, IdentifyOperation, Properties};
use serde_json::Value;
use tracing::{debug, warn};

use crate::pipeline::EventPipeline;
use crate::storage::Storage;
use crate::timer::OneShotTimer;
use crate::worker::{Job, JobQueue};

type Identity = (Option<String>, Option<String>);

pub(crate) struct IdentifyInterceptor {
	storage: Arc<dyn Storage>,
	pipeline: Arc<EventPipeline>,
	jobs: JobQueue,
	batch_delay: Duration,
	last_identity: Option<Identity>,
	timer: Option<OneShotTimer>,
}

impl IdentifyInterceptor {
	pub fn new(
		storage: Arc<dyn Storage>,
		pipeline: Arc<EventPipeline>,
		jobs: JobQueue,
		batch_delay: Duration,
	) -> Self {
		let mut interceptor = Self {
			storage,
			pipeline,
			jobs,
			batch_delay,
			last_identity: None,
			timer: None,
		};
		interceptor.schedule_recovered();
		interceptor
	}

	/// Returns the event to deliver, or `None` when it was parked.
	pub fn intercept(&mut self, mut event: Event) -> Option<Event> {
		let identity = (event.user_id.clone(), event.device_id.clone());
		if self.last_identity.as_ref() != Some(&identity) {
			if self.last_identity.is_some() {
				debug!("Identity changed, sending pending identify");
				self.transfer_pending();
			}
			self.last_identity = Some(identity);
		}

		if is_mergeable(&event) {
			match self.storage.append_event(&event) {
				Ok(()) => {
					self.schedule_timer();
					return None;
				}
				Err(e) => {
					warn!(error = %e, "Failed to park identify, sending it directly");
					return Some(event);
				}
			}
		}

		if is_clear_all(&event) {
			debug!("Identify clears all user properties, discarding pending identifies");
			self.cancel_timer();
			if let Err(e) = self.storage.reset() {
				warn!(error = %e, "Failed to discard pending identifies");
			}
			return Some(event);
		}

		if let Some(pending) = self.drain() {
			merge_pending_set(&mut event, pending);
		}
		Some(event)
	}

	/// Sends the merged pending identify, if any.
	pub fn transfer_pending(&mut self) {
		if let Some(merged) = self.drain() {
			debug!("Sending merged identify");
			self.pipeline.put(merged);
		}
	}

	pub fn on_timer_elapsed(&mut self) {
		self.timer = None;
		self.transfer_pending();
	}

	#[cfg(test)]
	pub fn has_pending_timer(&self) -> bool {
		self.timer.is_some()
	}

	pub fn stop(&mut self) {
		self.cancel_timer();
	}

	/// Identifies parked by a previous process still go out after one batch
	/// delay, even if no new identify arrives.
	fn schedule_recovered(&mut self) {
		if let Err(e) = self.storage.rollover() {
			warn!(error = %e, "Failed to roll over recovered identifies");
		}
		let blocks = self.storage.event_blocks().len();
		if blocks > 0 {
			debug!(blocks, "Found parked identifies from a previous run");
			self.schedule_timer();
		}
	}

	fn schedule_timer(&mut self) {
		if self.timer.is_none() {
			self.timer = Some(OneShotTimer::schedule(
				self.batch_delay,
				self.jobs.clone(),
				Job::IdentifyBatchElapsed,
			));
		}
	}

	fn cancel_timer(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.cancel();
		}
	}

	/// Removes every parked identify and merges them left to right. The last
	/// entry supplies the envelope (ids, timestamp, identity).
	fn drain(&mut self) -> Option<Event> {
		self.cancel_timer();
		if let Err(e) = self.storage.rollover() {
			warn!(error = %e, "Failed to roll over pending identifies");
		}

		let mut merged_set = Properties::new();
		let mut last: Option<Event> = None;
		for block in self.storage.event_blocks() {
			match self.storage.read_block(block) {
				Ok(raw) => match Event::parse_array(&raw) {
					Ok(events) => {
						for event in events {
							if let Some(Value::Object(set)) = event.user_operation(IdentifyOperation::Set) {
								merge_non_null(&mut merged_set, set);
							}
							last = Some(event);
						}
					}
					Err(e) => warn!(block = %block, error = %e, "Discarding unreadable pending identifies"),
				},
				Err(e) => warn!(block = %block, error = %e, "Failed to read pending identifies"),
			}
			if let Err(e) = self.storage.remove_block(block) {
				warn!(block = %block, error = %e, "Failed to remove pending identifies");
			}
		}

		let mut merged = last?;
		if merged_set.is_empty() {
			return None;
		}
		let mut user_properties = Properties::new();
		user_properties.insert(
			IdentifyOperation::Set.as_str().to_string(),
			Value::Object(merged_set),
		);
		merged.user_properties = Some(user_properties);
		Some(merged)
	}
}

/// An identify whose only operation is `$set`, with no groups.
fn is_mergeable(event: &Event) -> bool {
	if event.event_type != IDENTIFY_EVENT {
		return false;
	}
	if event.groups.as_ref().is_some_and(|g| !g.is_empty()) {
		return false;
	}
	match &event.user_properties {
		Some(props) => {
			props.len() == 1 && matches!(props.get(IdentifyOperation::Set.as_str()), Some(Value::Object(_)))
		}
		None => false,
	}
}

fn is_clear_all(event: &Event) -> bool {
	event.event_type == IDENTIFY_EVENT
		&& event.user_operation(IdentifyOperation::ClearAll).is_some()
}

fn merge_non_null(into: &mut Properties, from: &Properties) {
	for (key, value) in from {
		if !value.is_null() {
			into.insert(key.clone(), value.clone());
		}
	}
}

/// Attaches pending `$set` values to `event`. The event's own `$set` entries
/// win, and keys the event touches with another operation are left out.
fn merge_pending_set(event: &mut Event, pending: Event) {
	let Some(Value::Object(mut set)) = pending
		.user_properties
		.and_then(|mut props| props.remove(IdentifyOperation::Set.as_str()))
	else {
		return;
	};

	let user_properties = event.user_properties.get_or_insert_with(Properties::new);
	for (op, value) in user_properties.iter() {
		if op == IdentifyOperation::Set.as_str() {
			continue;
		}
		if let Value::Object(touched) = value {
			for key in touched.keys() {
				set.remove(key);
			}
		}
	}

	if let Some(Value::Object(own)) = user_properties.get(IdentifyOperation::Set.as_str()) {
		for (key, value) in own {
			set.insert(key.clone(), value.clone());
		}
	}
	if !set.is_empty() {
		user_properties.insert(IdentifyOperation::Set.as_str().to_string(), Value::Object(set));
	}
}
