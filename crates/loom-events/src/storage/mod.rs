// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence contract for delivery state.
//!
//! A [`Storage`] holds two kinds of data: a handful of small scalars that
//! must survive restarts (session counters, identity, opt-out) and the
//! queue of serialized events, organized as numbered blocks. Each block is
//! a JSON array of events. New events are appended to a single open block;
//! [`Storage::rollover`] closes it so that uploads only ever read blocks no
//! writer is touching.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::InMemoryStorage;

use loom_events_core::Event;
use serde_json::Value;
use thiserror::Error;

/// Scalar values kept alongside the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	LastEventId,
	PreviousSessionId,
	LastEventTime,
	OptOut,
	UserId,
	DeviceId,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::LastEventId => "last_event_id",
			StorageKey::PreviousSessionId => "previous_session_id",
			StorageKey::LastEventTime => "last_event_time",
			StorageKey::OptOut => "opt_out",
			StorageKey::UserId => "user_id",
			StorageKey::DeviceId => "device_id",
		}
	}
}

/// Handle to a closed block of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "block-{}", self.0)
	}
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("unknown block: {0}")]
	UnknownBlock(BlockId),
}

/// Durable storage used by the delivery pipeline.
///
/// Implementations synchronize internally; every method takes `&self`.
pub trait Storage: Send + Sync {
	fn read(&self, key: StorageKey) -> Option<Value>;

	/// Writes a scalar. `None` removes the key.
	fn write(&self, key: StorageKey, value: Option<Value>) -> Result<(), StorageError>;

	/// Appends an event to the open block, opening one if needed.
	fn append_event(&self, event: &Event) -> Result<(), StorageError>;

	/// Closes the open block, if any.
	fn rollover(&self) -> Result<(), StorageError>;

	/// Closed blocks, oldest first.
	fn event_blocks(&self) -> Vec<BlockId>;

	fn read_block(&self, id: BlockId) -> Result<String, StorageError>;

	/// Removes a block. Removing an unknown block is not an error.
	fn remove_block(&self, id: BlockId) -> Result<(), StorageError>;

	/// Replaces a block with smaller closed blocks holding the same events
	/// in the same order.
	fn split_block(&self, id: BlockId, events: &[Event]) -> Result<(), StorageError>;

	/// Removes every block and scalar.
	fn reset(&self) -> Result<(), StorageError>;

	fn read_i64(&self, key: StorageKey) -> Option<i64> {
		self.read(key).and_then(|v| v.as_i64())
	}

	fn read_string(&self, key: StorageKey) -> Option<String> {
		self.read(key).and_then(|v| v.as_str().map(str::to_string))
	}

	fn read_bool(&self, key: StorageKey) -> Option<bool> {
		self.read(key).and_then(|v| v.as_bool())
	}
}

/// Halves used when a block is split.
pub(crate) fn split_halves(events: &[Event]) -> Vec<&[Event]> {
	let mid = events.len().div_ceil(2);
	let (first, second) = events.split_at(mid);
	[first, second]
		.into_iter()
		.filter(|half| !half.is_empty())
		.collect()
}
