// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use loom_events_core::Event;
use parking_lot::Mutex;
use tracing::warn;

use crate::identify::IdentifyInterceptor;
use crate::pipeline::EventPipeline;
use crate::plugin::{Plugin, PluginKind};

/// Terminal stage that hands events to the delivery pipeline.
pub(crate) struct DestinationPlugin {
	interceptor: Mutex<IdentifyInterceptor>,
	pipeline: Arc<EventPipeline>,
}

impl DestinationPlugin {
	pub fn new(interceptor: IdentifyInterceptor, pipeline: Arc<EventPipeline>) -> Self {
		Self {
			interceptor: Mutex::new(interceptor),
			pipeline,
		}
	}

	pub fn on_identify_timer(&self) {
		self.interceptor.lock().on_timer_elapsed();
	}

	/// Sends anything parked in the identify accumulator.
	pub fn transfer_pending_identify(&self) {
		self.interceptor.lock().transfer_pending();
	}
}

impl Plugin for DestinationPlugin {
	fn kind(&self) -> PluginKind {
		PluginKind::Destination
	}

	fn name(&self) -> &str {
		"destination"
	}

	fn execute(&self, event: Event) -> Option<Event> {
		if !event.is_valid() {
			warn!(event_type = %event.event_type, "Dropping event without user id or device id");
			return None;
		}
		if let Some(event) = self.interceptor.lock().intercept(event) {
			self.pipeline.put(event);
		}
		None
	}

	fn flush(&self) {
		self.transfer_pending_identify();
		self.pipeline.flush();
	}

	fn teardown(&self) {
		self.interceptor.lock().stop();
		self.pipeline.stop();
	}
}
