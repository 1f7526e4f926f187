// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SDK self-diagnostics.
//!
//! Malformed payloads and delivery errors are collected here and attached to
//! the next upload as `request_metadata.sdk`, then cleared. Delivery counters
//! stay local and are exposed through [`DeliveryStats`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

const MAX_ERROR_LOGS: usize = 10;
const MAX_MALFORMED_EVENTS: usize = 10;

/// Snapshot of delivery outcomes since the client started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
	pub sent: u64,
	pub dropped: u64,
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub(crate) struct SdkDiagnostics {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub malformed_events: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub error_logs: Vec<String>,
}

#[derive(Default)]
pub(crate) struct Diagnostics {
	pending: Mutex<SdkDiagnostics>,
	sent: AtomicU64,
	dropped: AtomicU64,
}

impl Diagnostics {
	pub fn add_malformed_event(&self, raw: impl Into<String>) {
		let mut pending = self.pending.lock();
		if pending.malformed_events.len() < MAX_MALFORMED_EVENTS {
			pending.malformed_events.push(raw.into());
		}
	}

	/// Distinct messages only, capped.
	pub fn add_error_log(&self, message: impl Into<String>) {
		let message = message.into();
		let mut pending = self.pending.lock();
		if pending.error_logs.contains(&message) {
			return;
		}
		if pending.error_logs.len() >= MAX_ERROR_LOGS {
			pending.error_logs.remove(0);
		}
		pending.error_logs.push(message);
	}

	/// Takes everything collected so far, or `None` when there is nothing.
	pub fn extract(&self) -> Option<SdkDiagnostics> {
		let mut pending = self.pending.lock();
		if pending.malformed_events.is_empty() && pending.error_logs.is_empty() {
			return None;
		}
		Some(std::mem::take(&mut *pending))
	}

	pub fn record_sent(&self, count: usize) {
		self.sent.fetch_add(count as u64, Ordering::Relaxed);
	}

	pub fn record_dropped(&self, count: usize) {
		self.dropped.fetch_add(count as u64, Ordering::Relaxed);
	}

	pub fn stats(&self) -> DeliveryStats {
		DeliveryStats {
			sent: self.sent.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
		}
	}
}
