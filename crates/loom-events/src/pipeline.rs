// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event persistence, batching and upload.
//!
//! Events are appended to the open storage block as they arrive. A flush
//! closes that block and uploads closed blocks one at a time through a
//! single upload lane: the lane is claimed before a block is read, so
//! overlapping flushes never send or resolve the same block twice. The HTTP
//! call runs in a spawned task and its outcome re-enters the worker as
//! [`Job::UploadFinished`], where the [`ResponseHandler`] decides what happens
//! to the block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use loom_common_http::{Backoff, RetryableError};
use loom_events_core::{Event, EventCallback};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::diagnostics::Diagnostics;
use crate::error::SendError;
use crate::response::ResponseHandler;
use crate::storage::{BlockId, Storage, StorageError};
use crate::timer::FlushTimer;
use crate::worker::{Job, JobQueue};

/// Handler for sending serialized blocks to the server.
#[async_trait::async_trait]
pub trait BatchSender: Send + Sync {
	/// Sends one block (a JSON array of events). Returns the success status.
	async fn send_batch(&self, events: &str) -> Result<u16, SendError>;
}

#[derive(Default)]
struct UploadLane {
	busy: bool,
	/// Held busy by a failed upload until [`Job::ResumeUpload`] arrives.
	retry_pending: bool,
	current: Option<BlockId>,
	failures: u32,
	waiters: Vec<oneshot::Sender<()>>,
}

pub(crate) struct EventPipeline {
	config: Arc<Configuration>,
	storage: Arc<dyn Storage>,
	sender: Arc<dyn BatchSender>,
	diagnostics: Arc<Diagnostics>,
	jobs: JobQueue,
	callbacks: Mutex<HashMap<String, EventCallback>>,
	event_count: AtomicUsize,
	offline: AtomicBool,
	closing: AtomicBool,
	lane: Mutex<UploadLane>,
	flush_timer: Mutex<Option<FlushTimer>>,
	backoff: Backoff,
}

impl EventPipeline {
	pub fn new(
		config: Arc<Configuration>,
		storage: Arc<dyn Storage>,
		sender: Arc<dyn BatchSender>,
		diagnostics: Arc<Diagnostics>,
		jobs: JobQueue,
	) -> Self {
		let offline = config.offline;
		Self {
			config,
			storage,
			sender,
			diagnostics,
			jobs,
			callbacks: Mutex::new(HashMap::new()),
			event_count: AtomicUsize::new(0),
			offline: AtomicBool::new(offline),
			closing: AtomicBool::new(false),
			lane: Mutex::new(UploadLane::default()),
			flush_timer: Mutex::new(None),
			backoff: Backoff::default(),
		}
	}

	pub fn config(&self) -> &Configuration {
		&self.config
	}

	pub fn storage(&self) -> &Arc<dyn Storage> {
		&self.storage
	}

	pub fn diagnostics(&self) -> &Diagnostics {
		&self.diagnostics
	}

	/// Persists an event and flushes once enough events are queued.
	pub fn put(&self, mut event: Event) {
		event.attempts += 1;

		let callback = event.callback.take();
		if callback.is_some() && event.insert_id.is_none() {
			event.insert_id = Some(uuid::Uuid::new_v4().to_string());
		}

		if let Err(e) = self.storage.append_event(&event) {
			error!(error = %e, event_type = %event.event_type, "Failed to persist event");
			return;
		}

		if let (Some(callback), Some(insert_id)) = (callback, event.insert_id.clone()) {
			self.callbacks.lock().insert(insert_id, callback);
		}

		let count = self.event_count.fetch_add(1, Ordering::SeqCst) + 1;
		if count >= self.config.flush_threshold() {
			self.flush();
		}
	}

	/// Closes the open block and starts uploading every pending block.
	pub fn flush(&self) {
		if self.is_offline() {
			debug!("Skipping flush while offline");
			self.resolve_waiters();
			return;
		}

		let count = self.event_count.swap(0, Ordering::SeqCst);
		debug!(count, "Flushing events");
		if let Err(e) = self.storage.rollover() {
			warn!(error = %e, "Failed to roll over event block");
		}
		self.send_next();
	}

	/// Registers a waiter resolved when the current upload cycle ends, either
	/// because no blocks remain or because delivery was deferred.
	pub fn add_flush_waiter(&self, waiter: oneshot::Sender<()>) {
		self.lane.lock().waiters.push(waiter);
	}

	/// Starts the periodic flush timer.
	pub fn start(&self) {
		let mut timer = self.flush_timer.lock();
		if timer.is_none() {
			*timer = Some(FlushTimer::start(
				self.config.flush_interval,
				self.jobs.clone(),
			));
		}
	}

	/// Stops the periodic flush timer.
	pub fn stop(&self) {
		if let Some(timer) = self.flush_timer.lock().take() {
			timer.stop();
		}
	}

	pub fn is_offline(&self) -> bool {
		self.offline.load(Ordering::SeqCst)
	}

	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
		if !offline {
			self.lane.lock().failures = 0;
		}
	}

	/// Stops retrying after failures so shutdown does not wait on backoff.
	/// A lane parked for a retry is released so the final flush can claim it.
	pub fn begin_close(&self) {
		self.closing.store(true, Ordering::SeqCst);
		let mut lane = self.lane.lock();
		if lane.retry_pending {
			debug!("Releasing upload lane held for retry");
			lane.retry_pending = false;
			lane.busy = false;
		}
	}

	#[cfg(test)]
	pub fn is_idle(&self) -> bool {
		!self.lane.lock().busy
	}

	#[cfg(test)]
	pub fn consecutive_failures(&self) -> u32 {
		self.lane.lock().failures
	}

	pub fn take_callback(&self, insert_id: &str) -> Option<EventCallback> {
		self.callbacks.lock().remove(insert_id)
	}

	#[cfg(test)]
	pub fn has_callback(&self, insert_id: &str) -> bool {
		self.callbacks.lock().contains_key(insert_id)
	}

	/// Applies the outcome of an upload started by [`Self::send_next`].
	pub fn on_upload_finished(&self, block: BlockId, raw: String, result: Result<u16, SendError>) {
		let handled = ResponseHandler::new(self, block, &raw).handle(&result);
		let retryable = result.as_ref().err().map_or(true, RetryableError::is_retryable);

		let failures = {
			let mut lane = self.lane.lock();
			if lane.current != Some(block) {
				warn!(block = %block, "Upload result for a block the lane did not claim");
			}
			lane.current = None;
			if result.is_ok() {
				lane.failures = 0;
			} else if !handled {
				lane.failures += 1;
			}
			lane.failures
		};

		if failures > self.config.flush_max_retries {
			self.offline.store(true, Ordering::SeqCst);
			error!(
				failures,
				max_retries = self.config.flush_max_retries,
				"Upload failed too many times, marking offline"
			);
			self.release_lane();
			return;
		}

		if failures == 0 || handled {
			self.release_lane_quietly();
			self.send_next();
			return;
		}

		if self.closing.load(Ordering::SeqCst) {
			debug!(block = %block, "Not retrying upload during shutdown");
			self.release_lane();
			return;
		}

		if !retryable {
			warn!(block = %block, failures, "Upload rejected, keeping block for the next flush");
			self.release_lane();
			return;
		}

		let delay = self.backoff.delay(failures);
		warn!(
			failures,
			delay_ms = delay.as_millis() as u64,
			"Upload failed, retrying after backoff"
		);
		self.lane.lock().retry_pending = true;
		self.resolve_waiters();
		let jobs = self.jobs.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if jobs.send(Job::ResumeUpload).is_err() {
				debug!("Worker gone before upload retry");
			}
		});
	}

	/// Continues uploading after a backoff delay. Does nothing when the
	/// lane was already released by [`Self::begin_close`].
	pub fn resume_upload(&self) {
		{
			let mut lane = self.lane.lock();
			if !lane.retry_pending {
				debug!("No upload retry pending");
				return;
			}
			lane.retry_pending = false;
		}
		self.release_lane_quietly();
		self.send_next();
	}

	/// Drops whole blocks, oldest first, until at most `max` events remain.
	pub fn trim_queued_events(&self, max: usize) {
		if let Err(e) = self.storage.rollover() {
			warn!(error = %e, "Failed to roll over event block before trimming");
		}
		let mut kept = 0usize;
		let mut removed = 0usize;
		for block in self.storage.event_blocks().into_iter().rev() {
			let count = self
				.storage
				.read_block(block)
				.ok()
				.and_then(|raw| Event::parse_array(&raw).ok())
				.map_or(0, |events| events.len());
			if kept + count <= max {
				kept += count;
				continue;
			}
			if let Err(e) = self.storage.remove_block(block) {
				warn!(block = %block, error = %e, "Failed to trim event block");
				continue;
			}
			removed += count;
		}
		if removed > 0 {
			info!(removed, kept, "Trimmed queued events");
		}
	}

	fn send_next(&self) {
		{
			let mut lane = self.lane.lock();
			if lane.busy {
				debug!("Upload in progress, skipping");
				return;
			}
			lane.busy = true;
		}

		match self.next_block() {
			Some((block, raw)) => {
				self.lane.lock().current = Some(block);
				self.spawn_upload(block, raw);
			}
			None => self.release_lane(),
		}
	}

	/// Finds the oldest block that can be uploaded, discarding any that
	/// cannot be decoded.
	fn next_block(&self) -> Option<(BlockId, String)> {
		loop {
			if self.is_offline() {
				debug!("Skipping upload while offline");
				return None;
			}
			let block = *self.storage.event_blocks().first()?;
			let raw = match self.storage.read_block(block) {
				Ok(raw) => raw,
				Err(StorageError::UnknownBlock(_)) => continue,
				Err(e) => {
					error!(block = %block, error = %e, "Failed to read event block");
					return None;
				}
			};
			if raw.trim().is_empty() || Event::parse_array(&raw).is_err() {
				ResponseHandler::new(self, block, &raw).discard_corrupted();
				continue;
			}
			return Some((block, raw));
		}
	}

	fn spawn_upload(&self, block: BlockId, raw: String) {
		debug!(block = %block, "Uploading event block");
		let sender = self.sender.clone();
		let jobs = self.jobs.clone();
		tokio::spawn(async move {
			let result = sender.send_batch(&raw).await;
			if jobs
				.send(Job::UploadFinished { block, raw, result })
				.is_err()
			{
				debug!(block = %block, "Worker gone before upload finished");
			}
		});
	}

	fn release_lane(&self) {
		self.release_lane_quietly();
		self.resolve_waiters();
	}

	fn release_lane_quietly(&self) {
		self.lane.lock().busy = false;
	}

	fn resolve_waiters(&self) {
		let waiters = std::mem::take(&mut self.lane.lock().waiters);
		for waiter in waiters {
			let _ = waiter.send(());
		}
	}
}


#[cfg(test)]
mod tests {
	use super::test_support::*;
	use super::*;
	use std::sync::atomic::AtomicU16;

	use crate::storage::InMemoryStorage;

	#[tokio::test]
	async fn put_persists_and_counts_attempts() {
		let harness = Harness::new(config());
		harness.pipeline.put(event("a", "id-a"));
		let queued = harness.queued_events();
		assert_eq!(queued.len(), 1);
		assert_eq!(queued[0].event_type, "a");
	}

	#[tokio::test]
	async fn put_registers_callback_by_insert_id() {
		let harness = Harness::new(config());
		let callback = EventCallback::new(|_, _, _| {});
		harness
			.pipeline
			.put(event("a", "id-a").with_callback(callback));
		assert!(harness.pipeline.has_callback("id-a"));
	}

	#[tokio::test]
	async fn put_assigns_insert_id_when_callback_needs_one() {
		let harness = Harness::new(config());
		let callback = EventCallback::new(|_, _, _| {});
		harness
			.pipeline
			.put(Event::new("a").with_user_id("u").with_callback(callback));
		let queued = harness.queued_events();
		let insert_id = queued[0].insert_id.clone().unwrap();
		assert!(harness.pipeline.has_callback(&insert_id));
	}

	#[tokio::test]
	async fn reaching_threshold_triggers_upload() {
		let config = Configuration::builder("k")
			.flush_queue_size(2)
			.storage(crate::config::StorageConfig::InMemory)
			.build()
			.unwrap();
		let mut harness = Harness::new(config);
		harness.pipeline.put(event("a", "1"));
		assert!(harness.sender.sent.lock().is_empty());
		harness.pipeline.put(event("b", "2"));
		assert!(harness.pump_upload().await);
		let sent = harness.sender.sent_events();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].len(), 2);
		assert!(harness.queued_events().is_empty());
	}

	#[tokio::test]
	async fn success_fires_callbacks_once_and_removes_block() {
		let mut harness = Harness::new(config());
		let code = Arc::new(AtomicU16::new(0));
		let code_cb = code.clone();
		harness.pipeline.put(
			event("a", "id-a").with_callback(EventCallback::new(move |_, c, _| {
				code_cb.fetch_add(c, Ordering::SeqCst);
			})),
		);
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert_eq!(code.load(Ordering::SeqCst), 200);
		assert!(!harness.pipeline.has_callback("id-a"));
		assert!(harness.storage.event_blocks().is_empty());
		assert!(harness.pipeline.is_idle());
	}

	#[tokio::test]
	async fn uploads_blocks_one_at_a_time() {
		let mut harness = Harness::new(config());
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.flush();
		harness.pipeline.put(event("b", "2"));
		// Lane is busy with the first block; this flush only closes the second.
		harness.pipeline.flush();
		assert!(!harness.pipeline.is_idle());
		assert!(harness.pump_upload().await);
		assert!(harness.pump_upload().await);
		let sent = harness.sender.sent_events();
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[0][0].event_type, "a");
		assert_eq!(sent[1][0].event_type, "b");
		assert!(harness.pipeline.is_idle());
	}

	#[tokio::test]
	async fn transient_failure_keeps_block_and_counts_failure() {
		let mut harness = Harness::new(config());
		harness.sender.push_status(503, "unavailable");
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert_eq!(harness.pipeline.consecutive_failures(), 1);
		assert_eq!(harness.storage.event_blocks().len(), 1);
		assert!(!harness.pipeline.is_offline());
	}

	#[tokio::test(start_paused = true)]
	async fn retries_after_backoff_then_succeeds() {
		let mut harness = Harness::new(config());
		harness.sender.push_status(500, "");
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);

		match harness.jobs.recv().await {
			Some(Job::ResumeUpload) => harness.pipeline.resume_upload(),
			_ => panic!("expected resume job"),
		}
		assert!(harness.pump_upload().await);
		assert_eq!(harness.pipeline.consecutive_failures(), 0);
		assert!(harness.storage.event_blocks().is_empty());
		assert_eq!(harness.sender.sent.lock().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn goes_offline_after_max_retries() {
		let config = Configuration::builder("k")
			.flush_max_retries(2)
			.flush_queue_size(1000)
			.storage(crate::config::StorageConfig::InMemory)
			.build()
			.unwrap();
		let mut harness = Harness::new(config);
		for _ in 0..3 {
			harness.sender.push_status(502, "");
		}
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.flush();

		for _ in 0..2 {
			assert!(harness.pump_upload().await);
			match harness.jobs.recv().await {
				Some(Job::ResumeUpload) => harness.pipeline.resume_upload(),
				_ => panic!("expected resume job"),
			}
		}
		assert!(harness.pump_upload().await);
		assert!(harness.pipeline.is_offline());
		assert!(harness.pipeline.is_idle());
		assert_eq!(harness.storage.event_blocks().len(), 1);

		// Offline flushes never reach the sender.
		harness.pipeline.flush();
		assert_eq!(harness.sender.sent.lock().len(), 3);

		harness.pipeline.set_offline(false);
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert!(harness.storage.event_blocks().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn closing_releases_lane_held_for_retry() {
		let mut harness = Harness::new(config());
		harness.sender.push_status(503, "unavailable");
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert!(!harness.pipeline.is_idle());

		harness.pipeline.begin_close();
		assert!(harness.pipeline.is_idle());

		// The final flush claims the lane straight away.
		let (tx, rx) = oneshot::channel();
		harness.pipeline.add_flush_waiter(tx);
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert!(rx.await.is_ok());
		assert!(harness.storage.event_blocks().is_empty());

		// The backoff timer still fires but finds nothing to resume.
		match harness.jobs.recv().await {
			Some(Job::ResumeUpload) => harness.pipeline.resume_upload(),
			_ => panic!("expected resume job"),
		}
		assert!(harness.pipeline.is_idle());
		assert_eq!(harness.sender.sent.lock().len(), 2);
	}

	#[tokio::test]
	async fn failure_while_closing_keeps_block_and_resolves_waiters() {
		let mut harness = Harness::new(config());
		harness.sender.push_status(503, "unavailable");
		harness.pipeline.put(event("a", "1"));
		harness.pipeline.begin_close();
		let (tx, rx) = oneshot::channel();
		harness.pipeline.add_flush_waiter(tx);
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert!(rx.await.is_ok());
		assert!(harness.pipeline.is_idle());
		assert_eq!(harness.storage.event_blocks().len(), 1);
	}

	#[tokio::test]
	async fn rejected_upload_waits_for_next_flush_without_backoff() {
		let mut harness = Harness::new(config());
		harness.sender.push_status(401, "invalid api key");
		harness.pipeline.put(event("a", "1"));
		let (tx, rx) = oneshot::channel();
		harness.pipeline.add_flush_waiter(tx);
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);

		assert!(rx.await.is_ok());
		assert!(harness.pipeline.is_idle());
		assert_eq!(harness.pipeline.consecutive_failures(), 1);
		assert_eq!(harness.storage.event_blocks().len(), 1);
		assert!(harness.jobs.try_recv().is_err());

		harness.pipeline.flush();
		assert!(harness.pump_upload().await);
		assert!(harness.storage.event_blocks().is_empty());
		assert_eq!(harness.pipeline.consecutive_failures(), 0);
	}

	struct ReadOnlyStorage(InMemoryStorage);

	impl Storage for ReadOnlyStorage {
		fn read(&self, key: crate::storage::StorageKey) -> Option<serde_json::Value> {
			self.0.read(key)
		}

		fn write(
			&self,
			key: crate::storage::StorageKey,
			value: Option<serde_json::Value>,
		) -> Result<(), StorageError> {
			self.0.write(key, value)
		}

		fn append_event(&self, _event: &Event) -> Result<(), StorageError> {
			Err(StorageError::Io(std::io::Error::new(
				std::io::ErrorKind::PermissionDenied,
				"read-only",
			)))
		}

		fn rollover(&self) -> Result<(), StorageError> {
			self.0.rollover()
		}

		fn event_blocks(&self) -> Vec<BlockId> {
			self.0.event_blocks()
		}

		fn read_block(&self, id: BlockId) -> Result<String, StorageError> {
			self.0.read_block(id)
		}

		fn remove_block(&self, id: BlockId) -> Result<(), StorageError> {
			self.0.remove_block(id)
		}

		fn split_block(&self, id: BlockId, events: &[Event]) -> Result<(), StorageError> {
			self.0.split_block(id, events)
		}

		fn reset(&self) -> Result<(), StorageError> {
			self.0.reset()
		}
	}

	#[tokio::test]
	async fn failed_append_does_not_register_callback() {
		let (queue, _jobs) = JobQueue::channel();
		let pipeline = EventPipeline::new(
			Arc::new(config()),
			Arc::new(ReadOnlyStorage(InMemoryStorage::new())),
			Arc::new(ScriptedSender::default()),
			Arc::new(Diagnostics::default()),
			queue,
		);
		pipeline.put(event("a", "id-a").with_callback(EventCallback::new(|_, _, _| {})));
		assert!(!pipeline.has_callback("id-a"));
		assert!(pipeline.storage().event_blocks().is_empty());
	}

	#[tokio::test]
	async fn corrupted_block_is_discarded_without_upload() {
		let mut harness = Harness::new(config());
		let insert_id = "0e6f9a52-5c1a-4d0e-9d6b-2a3f4c5d6e7f";
		harness.pipeline.put(
			event("lost", insert_id).with_callback(EventCallback::new(|_, _, _| {})),
		);
		// Replace the persisted block with a copy missing its opening bracket.
		harness.storage.rollover().unwrap();
		let block = harness.storage.event_blocks()[0];
		let raw = harness.storage.read_block(block).unwrap();
		harness.storage.remove_block(block).unwrap();
		harness.storage.insert_raw_block(&raw[1..]);

		harness.pipeline.put(event("next", "2"));
		harness.pipeline.flush();
		assert!(harness.pump_upload().await);

		let sent = harness.sender.sent_events();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0][0].event_type, "next");
		assert!(harness.storage.event_blocks().is_empty());
		assert!(!harness.pipeline.has_callback(insert_id));
		let diagnostics = harness.pipeline.diagnostics().extract().unwrap();
		assert_eq!(diagnostics.malformed_events.len(), 1);
	}

	#[tokio::test]
	async fn waiter_resolves_when_queue_drains() {
		let mut harness = Harness::new(config());
		harness.pipeline.put(event("a", "1"));
		let (tx, mut rx) = oneshot::channel();
		harness.pipeline.add_flush_waiter(tx);
		harness.pipeline.flush();
		assert!(rx.try_recv().is_err());
		assert!(harness.pump_upload().await);
		assert!(rx.await.is_ok());
	}

	#[tokio::test]
	async fn trim_keeps_newest_blocks() {
		let harness = Harness::new(config());
		for i in 0..3 {
			harness.pipeline.put(event(&format!("e{i}"), &i.to_string()));
			harness.storage.rollover().unwrap();
		}
		harness.pipeline.trim_queued_events(2);
		let remaining: Vec<String> = harness
			.queued_events()
			.into_iter()
			.map(|e| e.event_type)
			.collect();
		assert_eq!(remaining, vec!["e1", "e2"]);
	}
}
