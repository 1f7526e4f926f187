// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{BTreeMap, HashMap};

use loom_events_core::Event;
use parking_lot::Mutex;
use serde_json::Value;

use super::{split_halves, BlockId, Storage, StorageError, StorageKey};

/// Process-local storage with the same block semantics as [`FileStorage`].
///
/// [`FileStorage`]: super::FileStorage
#[derive(Default)]
pub struct InMemoryStorage {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	values: HashMap<StorageKey, Value>,
	open: Vec<String>,
	blocks: BTreeMap<u64, String>,
	next_index: u64,
}

impl Inner {
	fn close_open(&mut self) {
		if self.open.is_empty() {
			return;
		}
		let block = format!("[{}]", self.open.join(","));
		self.open.clear();
		self.blocks.insert(self.next_index, block);
		self.next_index += 1;
	}
}

impl InMemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores an arbitrary closed block, bypassing encoding.
	#[cfg(test)]
	pub(crate) fn insert_raw_block(&self, raw: &str) -> BlockId {
		let mut inner = self.inner.lock();
		let index = inner.next_index;
		inner.next_index += 1;
		inner.blocks.insert(index, raw.to_string());
		BlockId(index)
	}
}

impl Storage for InMemoryStorage {
	fn read(&self, key: StorageKey) -> Option<Value> {
		self.inner.lock().values.get(&key).cloned()
	}

	fn write(&self, key: StorageKey, value: Option<Value>) -> Result<(), StorageError> {
		let mut inner = self.inner.lock();
		match value {
			Some(value) => inner.values.insert(key, value),
			None => inner.values.remove(&key),
		};
		Ok(())
	}

	fn append_event(&self, event: &Event) -> Result<(), StorageError> {
		let encoded = serde_json::to_string(event)?;
		self.inner.lock().open.push(encoded);
		Ok(())
	}

	fn rollover(&self) -> Result<(), StorageError> {
		self.inner.lock().close_open();
		Ok(())
	}

	fn event_blocks(&self) -> Vec<BlockId> {
		self.inner.lock().blocks.keys().copied().map(BlockId).collect()
	}

	fn read_block(&self, id: BlockId) -> Result<String, StorageError> {
		self
			.inner
			.lock()
			.blocks
			.get(&id.0)
			.cloned()
			.ok_or(StorageError::UnknownBlock(id))
	}

	fn remove_block(&self, id: BlockId) -> Result<(), StorageError> {
		self.inner.lock().blocks.remove(&id.0);
		Ok(())
	}

	fn split_block(&self, id: BlockId, events: &[Event]) -> Result<(), StorageError> {
		let encoded = split_halves(events)
			.into_iter()
			.map(Event::to_array_string)
			.collect::<Result<Vec<_>, _>>()?;

		let mut inner = self.inner.lock();
		for block in encoded {
			let index = inner.next_index;
			inner.next_index += 1;
			inner.blocks.insert(index, block);
		}
		inner.blocks.remove(&id.0);
		Ok(())
	}

	fn reset(&self) -> Result<(), StorageError> {
		let mut inner = self.inner.lock();
		inner.values.clear();
		inner.open.clear();
		inner.blocks.clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn satisfies_storage_contract() {
		crate::storage::tests::exercise_contract(&InMemoryStorage::new());
	}

	#[test]
	fn rollover_without_events_creates_no_block() {
		let storage = InMemoryStorage::new();
		storage.rollover().unwrap();
		assert!(storage.event_blocks().is_empty());
	}
}
