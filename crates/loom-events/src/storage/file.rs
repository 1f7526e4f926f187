// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! File-backed storage.
//!
//! Layout below the root directory:
//!
//! ```text
//! state.json        scalar values, replaced atomically
//! events/<n>        closed block n, a complete JSON array
//! events/<n>.tmp    the open block, written as `[e1,e2,...` and closed
//!                   with `]` plus a rename
//! ```
//!
//! A `.tmp` block left behind by a crashed process is closed when the
//! storage is opened so its events are delivered on the next launch.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use loom_events_core::Event;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{split_halves, BlockId, Storage, StorageError, StorageKey};

const STATE_FILE: &str = "state.json";
const EVENTS_DIR: &str = "events";
const OPEN_SUFFIX: &str = "tmp";

pub struct FileStorage {
	root: PathBuf,
	max_block_bytes: u64,
	inner: Mutex<Inner>,
}

struct Inner {
	values: Map<String, Value>,
	open: Option<OpenBlock>,
	next_index: u64,
}

struct OpenBlock {
	index: u64,
	file: File,
	bytes: u64,
	events: usize,
}

impl FileStorage {
	/// Opens or creates storage rooted at `root`.
	pub fn open(root: impl Into<PathBuf>, max_block_bytes: u64) -> Result<Self, StorageError> {
		let root = root.into();
		let events_dir = root.join(EVENTS_DIR);
		fs::create_dir_all(&events_dir)?;

		let values = load_state(&root.join(STATE_FILE));

		let mut max_index = None;
		for entry in fs::read_dir(&events_dir)? {
			let path = entry?.path();
			let Some((index, open)) = parse_block_name(&path) else {
				continue;
			};
			if open {
				recover_open_block(&path, &events_dir.join(index.to_string()))?;
			}
			max_index = max_index.max(Some(index));
		}

		debug!(root = %root.display(), "Opened event storage");

		Ok(Self {
			root,
			max_block_bytes,
			inner: Mutex::new(Inner {
				values,
				open: None,
				next_index: max_index.map_or(0, |i| i + 1),
			}),
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn events_dir(&self) -> PathBuf {
		self.root.join(EVENTS_DIR)
	}

	fn closed_path(&self, index: u64) -> PathBuf {
		self.events_dir().join(index.to_string())
	}

	fn open_path(&self, index: u64) -> PathBuf {
		self.events_dir().join(format!("{index}.{OPEN_SUFFIX}"))
	}

	fn close_block(&self, mut block: OpenBlock) -> Result<(), StorageError> {
		block.file.write_all(b"]")?;
		block.file.sync_data()?;
		drop(block.file);
		fs::rename(self.open_path(block.index), self.closed_path(block.index))?;
		debug!(block = %BlockId(block.index), events = block.events, "Closed event block");
		Ok(())
	}

	fn persist_values(&self, values: &Map<String, Value>) -> Result<(), StorageError> {
		let path = self.root.join(STATE_FILE);
		let tmp = self.root.join(format!("{STATE_FILE}.{OPEN_SUFFIX}"));
		let encoded = serde_json::to_vec(values)?;
		{
			let mut file = File::create(&tmp)?;
			file.write_all(&encoded)?;
			file.sync_data()?;
		}
		fs::rename(&tmp, &path)?;
		Ok(())
	}

	fn write_closed_block(&self, index: u64, contents: &str) -> Result<(), StorageError> {
		let tmp = self.open_path(index);
		{
			let mut file = File::create(&tmp)?;
			file.write_all(contents.as_bytes())?;
			file.sync_data()?;
		}
		fs::rename(&tmp, self.closed_path(index))?;
		Ok(())
	}
}

impl Storage for FileStorage {
	fn read(&self, key: StorageKey) -> Option<Value> {
		self.inner.lock().values.get(key.as_str()).cloned()
	}

	fn write(&self, key: StorageKey, value: Option<Value>) -> Result<(), StorageError> {
		let mut inner = self.inner.lock();
		match value {
			Some(value) => inner.values.insert(key.as_str().to_string(), value),
			None => inner.values.remove(key.as_str()),
		};
		self.persist_values(&inner.values)
	}

	fn append_event(&self, event: &Event) -> Result<(), StorageError> {
		let encoded = serde_json::to_string(event)?;
		let mut inner = self.inner.lock();

		if inner.open.is_none() {
			let index = inner.next_index;
			let mut file = OpenOptions::new()
				.create_new(true)
				.append(true)
				.open(self.open_path(index))?;
			file.write_all(b"[")?;
			inner.next_index += 1;
			inner.open = Some(OpenBlock {
				index,
				file,
				bytes: 1,
				events: 0,
			});
		}

		let full = {
			let Some(block) = inner.open.as_mut() else {
				return Ok(());
			};
			if block.events > 0 {
				block.file.write_all(b",")?;
				block.bytes += 1;
			}
			block.file.write_all(encoded.as_bytes())?;
			block.file.flush()?;
			block.bytes += encoded.len() as u64;
			block.events += 1;
			block.bytes >= self.max_block_bytes
		};

		if full {
			if let Some(block) = inner.open.take() {
				self.close_block(block)?;
			}
		}
		Ok(())
	}

	fn rollover(&self) -> Result<(), StorageError> {
		let mut inner = self.inner.lock();
		match inner.open.take() {
			Some(block) => self.close_block(block),
			None => Ok(()),
		}
	}

	fn event_blocks(&self) -> Vec<BlockId> {
		let entries = match fs::read_dir(self.events_dir()) {
			Ok(entries) => entries,
			Err(e) => {
				warn!(error = %e, "Failed to list event blocks");
				return Vec::new();
			}
		};
		let mut blocks: Vec<BlockId> = entries
			.filter_map(|entry| entry.ok())
			.filter_map(|entry| match parse_block_name(&entry.path()) {
				Some((index, false)) => Some(BlockId(index)),
				_ => None,
			})
			.collect();
		blocks.sort();
		blocks
	}

	fn read_block(&self, id: BlockId) -> Result<String, StorageError> {
		match fs::read_to_string(self.closed_path(id.0)) {
			Ok(contents) => Ok(contents),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::UnknownBlock(id)),
			Err(e) => Err(e.into()),
		}
	}

	fn remove_block(&self, id: BlockId) -> Result<(), StorageError> {
		match fs::remove_file(self.closed_path(id.0)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	fn split_block(&self, id: BlockId, events: &[Event]) -> Result<(), StorageError> {
		let encoded = split_halves(events)
			.into_iter()
			.map(Event::to_array_string)
			.collect::<Result<Vec<_>, _>>()?;

		let indices: Vec<u64> = {
			let mut inner = self.inner.lock();
			let start = inner.next_index;
			inner.next_index += encoded.len() as u64;
			(start..inner.next_index).collect()
		};
		for (index, contents) in indices.into_iter().zip(encoded) {
			self.write_closed_block(index, &contents)?;
		}
		self.remove_block(id)
	}

	fn reset(&self) -> Result<(), StorageError> {
		let mut inner = self.inner.lock();
		inner.open = None;
		for entry in fs::read_dir(self.events_dir())? {
			let path = entry?.path();
			if parse_block_name(&path).is_some() {
				fs::remove_file(&path)?;
			}
		}
		inner.values.clear();
		self.persist_values(&inner.values)
	}
}

/// Returns the block index and whether the block is still open.
fn parse_block_name(path: &Path) -> Option<(u64, bool)> {
	let name = path.file_name()?.to_str()?;
	match name.split_once('.') {
		Some((index, OPEN_SUFFIX)) => index.parse().ok().map(|i| (i, true)),
		Some(_) => None,
		None => name.parse().ok().map(|i| (i, false)),
	}
}

fn load_state(path: &Path) -> Map<String, Value> {
	let raw = match fs::read(path) {
		Ok(raw) => raw,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Map::new(),
		Err(e) => {
			warn!(error = %e, path = %path.display(), "Failed to read persisted state");
			return Map::new();
		}
	};
	match serde_json::from_slice(&raw) {
		Ok(values) => values,
		Err(e) => {
			warn!(error = %e, path = %path.display(), "Discarding unreadable persisted state");
			Map::new()
		}
	}
}

fn recover_open_block(open: &Path, closed: &Path) -> Result<(), StorageError> {
	let contents = fs::read_to_string(open)?;
	if contents.trim() == "[" || contents.trim().is_empty() {
		fs::remove_file(open)?;
		return Ok(());
	}
	let mut file = OpenOptions::new().append(true).open(open)?;
	file.write_all(b"]")?;
	file.sync_data()?;
	drop(file);
	fs::rename(open, closed)?;
	warn!(path = %closed.display(), "Recovered event block left open by a previous process");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tempfile::TempDir;

	fn open(dir: &TempDir) -> FileStorage {
		FileStorage::open(dir.path(), 1_000_000).unwrap()
	}

	#[test]
	fn satisfies_storage_contract() {
		let dir = TempDir::new().unwrap();
		crate::storage::tests::exercise_contract(&open(&dir));
	}

	#[test]
	fn values_survive_reopen() {
		let dir = TempDir::new().unwrap();
		{
			let storage = open(&dir);
			storage
				.write(StorageKey::PreviousSessionId, Some(json!(1000)))
				.unwrap();
			storage.write(StorageKey::OptOut, Some(json!(true))).unwrap();
		}
		let storage = open(&dir);
		assert_eq!(storage.read_i64(StorageKey::PreviousSessionId), Some(1000));
		assert_eq!(storage.read_bool(StorageKey::OptOut), Some(true));
	}

	#[test]
	fn open_block_from_crashed_process_is_recovered() {
		let dir = TempDir::new().unwrap();
		{
			let storage = open(&dir);
			storage.append_event(&Event::new("a").with_user_id("u")).unwrap();
			storage.append_event(&Event::new("b").with_user_id("u")).unwrap();
			// Dropped without rollover.
		}
		let storage = open(&dir);
		let blocks = storage.event_blocks();
		assert_eq!(blocks.len(), 1);
		let events = Event::parse_array(&storage.read_block(blocks[0]).unwrap()).unwrap();
		assert_eq!(events.len(), 2);
		assert_eq!(events[1].event_type, "b");

		// New blocks never reuse a recovered index.
		storage.append_event(&Event::new("c")).unwrap();
		storage.rollover().unwrap();
		let blocks = storage.event_blocks();
		assert_eq!(blocks.len(), 2);
		assert!(blocks[1] > blocks[0]);
	}

	#[test]
	fn empty_open_block_is_discarded_on_recovery() {
		let dir = TempDir::new().unwrap();
		fs::create_dir_all(dir.path().join(EVENTS_DIR)).unwrap();
		fs::write(dir.path().join(EVENTS_DIR).join("4.tmp"), "[").unwrap();
		let storage = open(&dir);
		assert!(storage.event_blocks().is_empty());
		assert!(!dir.path().join(EVENTS_DIR).join("4.tmp").exists());
	}

	#[test]
	fn block_rolls_over_at_size_threshold() {
		let dir = TempDir::new().unwrap();
		let storage = FileStorage::open(dir.path(), 32).unwrap();
		for i in 0..4 {
			storage
				.append_event(&Event::new(format!("event_number_{i}")).with_device_id("device"))
				.unwrap();
		}
		// Each event alone exceeds the threshold, so every append closes its block.
		assert_eq!(storage.event_blocks().len(), 4);
	}

	#[test]
	fn unreadable_state_file_starts_empty() {
		let dir = TempDir::new().unwrap();
		fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
		let storage = open(&dir);
		assert_eq!(storage.read(StorageKey::LastEventId), None);
	}

	#[test]
	fn ignores_foreign_files() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);
		fs::write(dir.path().join(EVENTS_DIR).join("notes.txt"), "hi").unwrap();
		assert!(storage.event_blocks().is_empty());
	}

	#[test]
	fn read_missing_block_is_unknown() {
		let dir = TempDir::new().unwrap();
		let storage = open(&dir);
		assert!(matches!(
			storage.read_block(BlockId(42)),
			Err(StorageError::UnknownBlock(BlockId(42)))
		));
	}
}
