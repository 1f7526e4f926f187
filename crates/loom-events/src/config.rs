// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use loom_events_core::constants::{
	BATCH_API_HOST, DEFAULT_API_HOST, DEFAULT_INSTANCE, EU_BATCH_API_HOST, EU_DEFAULT_API_HOST,
	FLUSH_INTERVAL, FLUSH_MAX_RETRIES, FLUSH_QUEUE_SIZE, IDENTIFY_BATCH_INTERVAL, MAX_BLOCK_BYTES,
	MIN_IDENTIFY_BATCH_INTERVAL, MIN_TIME_BETWEEN_SESSIONS_MILLIS,
};
use loom_events_core::{EventCallback, IngestionMetadata, Plan};

use crate::error::{EventsError, Result};
use crate::storage::Storage;

/// Data residency of the collection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerZone {
	#[default]
	Us,
	Eu,
}

/// Where events and identify entries are persisted.
#[derive(Clone, Default)]
pub enum StorageConfig {
	/// Platform data directory, one subdirectory per instance.
	#[default]
	Default,
	/// Explicit root directory. Event blocks and identify entries live in
	/// separate subdirectories below it.
	Directory(PathBuf),
	/// Non-durable storage, lost when the process exits.
	InMemory,
	/// Caller-provided stores.
	Custom {
		events: Arc<dyn Storage>,
		identify: Arc<dyn Storage>,
	},
}

impl fmt::Debug for StorageConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StorageConfig::Default => f.write_str("Default"),
			StorageConfig::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
			StorageConfig::InMemory => f.write_str("InMemory"),
			StorageConfig::Custom { .. } => f.write_str("Custom { .. }"),
		}
	}
}

/// Configuration for an [`Analytics`](crate::Analytics) instance.
#[derive(Debug, Clone)]
pub struct Configuration {
	pub api_key: String,
	pub instance_name: String,
	/// Number of queued events that triggers a flush.
	pub flush_queue_size: usize,
	/// Interval between automatic flushes.
	pub flush_interval: Duration,
	/// Consecutive failed uploads tolerated before going offline.
	pub flush_max_retries: u32,
	/// Gap after which a backgrounded app starts a new session.
	pub min_time_between_sessions_millis: i64,
	/// Emit `session_start`/`session_end` markers.
	pub track_session_events: bool,
	/// Window during which `$set`-only identifies are merged.
	pub identify_batch_interval: Duration,
	/// Lower bound applied to `identify_batch_interval`.
	pub min_identify_batch_interval: Duration,
	pub flush_events_on_close: bool,
	pub server_zone: ServerZone,
	pub use_batch: bool,
	/// Overrides the endpoint derived from zone and batch mode.
	pub server_url: Option<String>,
	pub min_id_length: Option<u32>,
	pub partner_id: Option<String>,
	pub plan: Option<Plan>,
	pub ingestion_metadata: Option<IngestionMetadata>,
	pub opt_out: bool,
	pub offline: bool,
	/// Keep at most this many persisted events at startup.
	pub max_queued_event_count: Option<usize>,
	pub max_block_bytes: u64,
	pub request_timeout: Duration,
	pub storage: StorageConfig,
	/// Receives every terminal delivery outcome.
	pub callback: Option<EventCallback>,
}

impl Configuration {
	pub fn builder(api_key: impl Into<String>) -> ConfigurationBuilder {
		ConfigurationBuilder::new(api_key)
	}

	/// The endpoint uploads are posted to.
	pub fn server_url(&self) -> &str {
		if let Some(url) = &self.server_url {
			return url;
		}
		match (self.server_zone, self.use_batch) {
			(ServerZone::Us, false) => DEFAULT_API_HOST,
			(ServerZone::Us, true) => BATCH_API_HOST,
			(ServerZone::Eu, false) => EU_DEFAULT_API_HOST,
			(ServerZone::Eu, true) => EU_BATCH_API_HOST,
		}
	}

	/// Queue length that triggers a flush.
	pub fn flush_threshold(&self) -> usize {
		self.flush_queue_size
	}

	pub fn identify_batch_delay(&self) -> Duration {
		self
			.identify_batch_interval
			.max(self.min_identify_batch_interval)
	}

	/// Directory used when storage is file backed.
	pub fn storage_root(&self) -> Option<PathBuf> {
		match &self.storage {
			StorageConfig::Default => {
				let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
				Some(
					base
						.join("loom-events")
						.join(sanitize_instance(&self.instance_name)),
				)
			}
			StorageConfig::Directory(path) => Some(path.clone()),
			_ => None,
		}
	}

	fn validate(&self) -> Result<()> {
		if self.api_key.trim().is_empty() {
			return Err(EventsError::InvalidApiKey);
		}
		if self.flush_queue_size == 0 {
			return Err(EventsError::InvalidConfiguration(
				"flush_queue_size must be positive".to_string(),
			));
		}
		if self.flush_interval.is_zero() {
			return Err(EventsError::InvalidConfiguration(
				"flush_interval must be positive".to_string(),
			));
		}
		if self.min_time_between_sessions_millis <= 0 {
			return Err(EventsError::InvalidConfiguration(
				"min_time_between_sessions_millis must be positive".to_string(),
			));
		}
		if self.min_id_length == Some(0) {
			return Err(EventsError::InvalidConfiguration(
				"min_id_length must be positive".to_string(),
			));
		}
		if self.instance_name.is_empty() {
			return Err(EventsError::InvalidConfiguration(
				"instance_name must not be empty".to_string(),
			));
		}
		Ok(())
	}
}

fn sanitize_instance(name: &str) -> String {
	name
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				c
			} else {
				'_'
			}
		})
		.collect()
}

/// Builder for [`Configuration`].
pub struct ConfigurationBuilder {
	config: Configuration,
}

impl ConfigurationBuilder {
	pub fn new(api_key: impl Into<String>) -> Self {
		Self {
			config: Configuration {
				api_key: api_key.into(),
				instance_name: DEFAULT_INSTANCE.to_string(),
				flush_queue_size: FLUSH_QUEUE_SIZE,
				flush_interval: FLUSH_INTERVAL,
				flush_max_retries: FLUSH_MAX_RETRIES,
				min_time_between_sessions_millis: MIN_TIME_BETWEEN_SESSIONS_MILLIS,
				track_session_events: true,
				identify_batch_interval: IDENTIFY_BATCH_INTERVAL,
				min_identify_batch_interval: MIN_IDENTIFY_BATCH_INTERVAL,
				flush_events_on_close: true,
				server_zone: ServerZone::default(),
				use_batch: false,
				server_url: None,
				min_id_length: None,
				partner_id: None,
				plan: None,
				ingestion_metadata: None,
				opt_out: false,
				offline: false,
				max_queued_event_count: None,
				max_block_bytes: MAX_BLOCK_BYTES,
				request_timeout: Duration::from_secs(60),
				storage: StorageConfig::default(),
				callback: None,
			},
		}
	}

	pub fn instance_name(mut self, name: impl Into<String>) -> Self {
		self.config.instance_name = name.into();
		self
	}

	pub fn flush_queue_size(mut self, size: usize) -> Self {
		self.config.flush_queue_size = size;
		self
	}

	pub fn flush_interval(mut self, interval: Duration) -> Self {
		self.config.flush_interval = interval;
		self
	}

	pub fn flush_max_retries(mut self, retries: u32) -> Self {
		self.config.flush_max_retries = retries;
		self
	}

	pub fn min_time_between_sessions_millis(mut self, millis: i64) -> Self {
		self.config.min_time_between_sessions_millis = millis;
		self
	}

	pub fn track_session_events(mut self, enabled: bool) -> Self {
		self.config.track_session_events = enabled;
		self
	}

	pub fn identify_batch_interval(mut self, interval: Duration) -> Self {
		self.config.identify_batch_interval = interval;
		self
	}

	/// Lowers the floor on the identify batch window. Intended for tests.
	pub fn min_identify_batch_interval(mut self, interval: Duration) -> Self {
		self.config.min_identify_batch_interval = interval;
		self
	}

	pub fn flush_events_on_close(mut self, enabled: bool) -> Self {
		self.config.flush_events_on_close = enabled;
		self
	}

	pub fn server_zone(mut self, zone: ServerZone) -> Self {
		self.config.server_zone = zone;
		self
	}

	pub fn use_batch(mut self, enabled: bool) -> Self {
		self.config.use_batch = enabled;
		self
	}

	pub fn server_url(mut self, url: impl Into<String>) -> Self {
		self.config.server_url = Some(url.into());
		self
	}

	pub fn min_id_length(mut self, length: u32) -> Self {
		self.config.min_id_length = Some(length);
		self
	}

	pub fn partner_id(mut self, partner_id: impl Into<String>) -> Self {
		self.config.partner_id = Some(partner_id.into());
		self
	}

	pub fn plan(mut self, plan: Plan) -> Self {
		self.config.plan = Some(plan);
		self
	}

	pub fn ingestion_metadata(mut self, metadata: IngestionMetadata) -> Self {
		self.config.ingestion_metadata = Some(metadata);
		self
	}

	pub fn opt_out(mut self, opt_out: bool) -> Self {
		self.config.opt_out = opt_out;
		self
	}

	pub fn offline(mut self, offline: bool) -> Self {
		self.config.offline = offline;
		self
	}

	pub fn max_queued_event_count(mut self, count: usize) -> Self {
		self.config.max_queued_event_count = Some(count);
		self
	}

	pub fn max_block_bytes(mut self, bytes: u64) -> Self {
		self.config.max_block_bytes = bytes;
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn storage(mut self, storage: StorageConfig) -> Self {
		self.config.storage = storage;
		self
	}

	pub fn callback(mut self, callback: EventCallback) -> Self {
		self.config.callback = Some(callback);
		self
	}

	pub fn build(self) -> Result<Configuration> {
		self.config.validate()?;
		Ok(self.config)
	}
}
