// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Disposition of an uploaded block.
//!
//! Every branch either removes the block (after firing callbacks for the
//! events that reached a terminal outcome), replaces it (413 split), or
//! leaves it in place for a later retry. The return value tells the
//! pipeline whether the outcome was handled, which keeps the failure
//! counter from growing on responses that made progress.

use loom_events_core::{BadRequestBody, Event};
use tracing::{debug, error, info, warn};

use crate::error::SendError;
use crate::pipeline::EventPipeline;
use crate::storage::BlockId;

const SUCCESS_MESSAGE: &str = "Successfully send event";
const INSERT_ID_MARKER: &str = "\"insert_id\":\"";
const MALFORMED_SAMPLE_LEN: usize = 256;

pub(crate) struct ResponseHandler<'a> {
	pipeline: &'a EventPipeline,
	block: BlockId,
	raw: &'a str,
}

impl<'a> ResponseHandler<'a> {
	pub fn new(pipeline: &'a EventPipeline, block: BlockId, raw: &'a str) -> Self {
		Self {
			pipeline,
			block,
			raw,
		}
	}

	/// Applies an upload outcome. Returns true when the response was handled.
	pub fn handle(&self, result: &Result<u16, SendError>) -> bool {
		match result {
			Ok(status) => self.handle_success(*status),
			Err(SendError::Status { status: 400, body }) => self.handle_bad_request(body),
			Err(SendError::Status { status: 413, body }) => self.handle_payload_too_large(body),
			Err(SendError::Status { status, body }) => {
				debug!(block = %self.block, status, body = %body, "Upload not accepted, keeping block");
				false
			}
			Err(SendError::InvalidPayload(reason)) => {
				warn!(block = %self.block, reason = %reason, "Block could not be encoded");
				self.discard_corrupted();
				true
			}
			Err(SendError::Transport(e)) => {
				debug!(block = %self.block, error = %e, "Upload did not complete, keeping block");
				false
			}
		}
	}

	/// Removes a block that cannot be decoded and forgets callbacks for any
	/// insert ids still readable in it.
	pub fn discard_corrupted(&self) {
		error!(block = %self.block, "Discarding unreadable event block");
		let sample: String = self.raw.chars().take(MALFORMED_SAMPLE_LEN).collect();
		self.pipeline.diagnostics().add_malformed_event(sample);
		for insert_id in insert_ids(self.raw) {
			self.pipeline.take_callback(insert_id);
		}
		self.remove_block();
	}

	fn handle_success(&self, status: u16) -> bool {
		let Some(events) = self.events() else {
			return true;
		};
		info!(block = %self.block, count = events.len(), "Uploaded events");
		self.trigger_callbacks(&events, status, SUCCESS_MESSAGE);
		self.remove_block();
		true
	}

	fn handle_bad_request(&self, body: &str) -> bool {
		let Some(events) = self.events() else {
			return true;
		};
		let response = BadRequestBody::parse(body);

		if response.is_invalid_api_key(&self.pipeline.config().api_key) {
			error!(count = events.len(), "Invalid API key, dropping events");
			self.trigger_callbacks(&events, 400, &response.error);
			self.remove_block();
			return true;
		}

		if events.len() == 1 {
			warn!(error = %response.error, "Event rejected by server, dropping");
			self.trigger_callbacks(&events, 400, &response.error);
			self.remove_block();
			return true;
		}

		let drop_indices = response.drop_indices();
		let silenced_devices = response.silenced_devices();
		let (dropped, retried): (Vec<(usize, Event)>, Vec<(usize, Event)>) =
			events.into_iter().enumerate().partition(|(index, event)| {
				drop_indices.contains(index)
					|| event
						.device_id
						.as_deref()
						.is_some_and(|device| silenced_devices.contains(device))
			});
		let dropped: Vec<Event> = dropped.into_iter().map(|(_, e)| e).collect();

		warn!(
			dropped = dropped.len(),
			retried = retried.len(),
			error = %response.error,
			"Bad request, dropping invalid events"
		);
		self.trigger_callbacks(&dropped, 400, &response.error);
		self.remove_block();
		for (_, event) in retried {
			self.pipeline.put(event);
		}
		!dropped.is_empty()
	}

	fn handle_payload_too_large(&self, body: &str) -> bool {
		let Some(events) = self.events() else {
			return true;
		};

		if events.len() == 1 {
			warn!("Single event exceeds the payload limit, dropping");
			self.trigger_callbacks(&events, 413, body);
			self.remove_block();
			return true;
		}

		info!(block = %self.block, count = events.len(), "Payload too large, splitting block");
		if let Err(e) = self.pipeline.storage().split_block(self.block, &events) {
			error!(block = %self.block, error = %e, "Failed to split event block");
			return false;
		}
		true
	}

	/// Decodes the block, discarding it when it is not valid.
	fn events(&self) -> Option<Vec<Event>> {
		match Event::parse_array(self.raw) {
			Ok(events) => Some(events),
			Err(e) => {
				debug!(block = %self.block, error = %e, "Uploaded block no longer decodes");
				self.discard_corrupted();
				None
			}
		}
	}

	fn trigger_callbacks(&self, events: &[Event], status: u16, message: &str) {
		let global = self.pipeline.config().callback.as_ref();
		for event in events {
			if let Some(callback) = global {
				callback.call(event, status, message);
			}
			if let Some(callback) = event
				.insert_id
				.as_deref()
				.and_then(|id| self.pipeline.take_callback(id))
			{
				callback.call(event, status, message);
			}
		}

		if (1..300).contains(&status) {
			self.pipeline.diagnostics().record_sent(events.len());
		} else {
			self.pipeline.diagnostics().record_dropped(events.len());
		}
	}

	fn remove_block(&self) {
		if let Err(e) = self.pipeline.storage().remove_block(self.block) {
			error!(block = %self.block, error = %e, "Failed to remove event block");
		}
	}
}

/// Insert ids that can still be read out of a serialized block.
fn insert_ids(raw: &str) -> impl Iterator<Item = &str> {
	raw.match_indices(INSERT_ID_MARKER).filter_map(move |(start, _)| {
		let rest = raw.get(start + INSERT_ID_MARKER.len()..)?;
		let end = rest.find('"')?;
		Some(&rest[..end])
	})
}
