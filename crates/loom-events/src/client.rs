// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The public analytics client.
//!
//! Every call is non-blocking: it posts a job to the worker and returns.
//! Getters for identity reflect jobs the worker has already applied, so a
//! value set a moment ago may not be visible until the queue drains. Use
//! [`Analytics::flush_and_wait`] when ordering matters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loom_events_core::{Event, Identify, Properties, Revenue};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Configuration, StorageConfig};
use crate::diagnostics::{DeliveryStats, Diagnostics};
use crate::error::{EventsError, Result};
use crate::http::HttpClient;
use crate::identify::IdentifyInterceptor;
use crate::pipeline::{BatchSender, EventPipeline};
use crate::plugin::{Plugin, Timeline};
use crate::plugins::{ContextPlugin, DestinationPlugin};
use crate::session::{SessionManager, SharedSessionId};
use crate::state::IdentityStore;
use crate::storage::{FileStorage, InMemoryStorage, Storage};
use crate::worker::{Job, JobQueue, Worker};

/// Handle to a running analytics instance.
///
/// Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct Analytics {
	inner: Arc<AnalyticsInner>,
}

struct AnalyticsInner {
	config: Arc<Configuration>,
	jobs: JobQueue,
	identity: Arc<IdentityStore>,
	session_id: SharedSessionId,
	diagnostics: Arc<Diagnostics>,
	closed: AtomicBool,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AnalyticsInner {
	fn drop(&mut self) {
		if let Some(worker) = self.worker.lock().take() {
			if !self.closed.load(Ordering::SeqCst) {
				debug!("Analytics dropped without shutdown, stopping worker");
			}
			worker.abort();
		}
	}
}

impl Analytics {
	/// Creates a client that uploads over HTTP.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new(config: Configuration) -> Result<Self> {
		let diagnostics = Arc::new(Diagnostics::default());
		let sender = Arc::new(HttpClient::new(&config, diagnostics.clone())?);
		Self::assemble(config, sender, diagnostics)
	}

	/// Creates a client that hands batches to a caller-provided sender.
	pub fn with_sender(config: Configuration, sender: Arc<dyn BatchSender>) -> Result<Self> {
		Self::assemble(config, sender, Arc::new(Diagnostics::default()))
	}

	fn assemble(
		config: Configuration,
		sender: Arc<dyn BatchSender>,
		diagnostics: Arc<Diagnostics>,
	) -> Result<Self> {
		let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
			EventsError::InvalidConfiguration("client must be created inside a Tokio runtime".into())
		})?;

		let (events, identify) = open_storage(&config)?;
		let config = Arc::new(config);
		let (jobs, rx) = JobQueue::channel();

		let pipeline = Arc::new(EventPipeline::new(
			config.clone(),
			events.clone(),
			sender,
			diagnostics.clone(),
			jobs.clone(),
		));
		if let Some(max) = config.max_queued_event_count {
			pipeline.trim_queued_events(max);
		}

		let identity = Arc::new(IdentityStore::load(events.clone(), config.opt_out));
		let sessions = SessionManager::load(
			events,
			config.min_time_between_sessions_millis,
			config.track_session_events,
		);
		let session_id = sessions.shared_session_id();

		let interceptor = IdentifyInterceptor::new(
			identify,
			pipeline.clone(),
			jobs.clone(),
			config.identify_batch_delay(),
		);
		let destination = Arc::new(DestinationPlugin::new(interceptor, pipeline.clone()));

		let timeline = Timeline::default();
		let context: Arc<dyn Plugin> = Arc::new(ContextPlugin::new(&config, identity.clone()));
		context.setup(&config);
		timeline.add(context);
		destination.setup(&config);
		timeline.add(destination.clone());

		let worker = Worker::new(
			config.clone(),
			timeline,
			sessions,
			pipeline.clone(),
			destination,
			identity.clone(),
			rx,
		);
		let handle = runtime.spawn(worker.run());
		pipeline.start();

		info!(
			instance = %config.instance_name,
			server_url = config.server_url(),
			"Analytics client started"
		);

		Ok(Self {
			inner: Arc::new(AnalyticsInner {
				config,
				jobs,
				identity,
				session_id,
				diagnostics,
				closed: AtomicBool::new(false),
				worker: Mutex::new(Some(handle)),
			}),
		})
	}

	pub fn config(&self) -> &Configuration {
		&self.inner.config
	}

	/// Queues an event. Callbacks attached to the event fire once its
	/// delivery outcome is known.
	pub fn track(&self, event: Event) {
		self.submit(Job::Process(event));
	}

	pub fn track_event(&self, event_type: impl Into<String>, properties: Option<Properties>) {
		let mut event = Event::new(event_type);
		event.event_properties = properties;
		self.track(event);
	}

	/// Sends user property operations.
	pub fn identify(&self, identify: Identify) {
		if identify.is_empty() {
			debug!("Ignoring empty identify");
			return;
		}
		self.track(identify.into_event());
	}

	pub fn group_identify(&self, group_type: &str, group_name: &str, identify: Identify) {
		if identify.is_empty() {
			debug!(group_type, "Ignoring empty group identify");
			return;
		}
		self.track(identify.into_group_event(group_type, group_name));
	}

	/// Assigns the user to a group. `group_name` may be a string or an array
	/// of strings.
	pub fn set_group(&self, group_type: &str, group_name: impl Into<Value>) {
		let group_name = group_name.into();
		let mut event = Identify::new()
			.set(group_type, group_name.clone())
			.into_event();
		let mut groups = Properties::new();
		groups.insert(group_type.to_string(), group_name);
		event.groups = Some(groups);
		self.track(event);
	}

	pub fn revenue(&self, revenue: Revenue) {
		if !revenue.is_valid() {
			warn!("Ignoring revenue without a price");
			return;
		}
		self.track(revenue.into_event());
	}

	pub fn set_user_id(&self, user_id: Option<String>) {
		self.submit(Job::SetUserId(user_id));
	}

	/// Placeholder and empty device ids are ignored.
	pub fn set_device_id(&self, device_id: impl Into<String>) {
		self.submit(Job::SetDeviceId(device_id.into()));
	}

	pub fn user_id(&self) -> Option<String> {
		self.inner.identity.user_id()
	}

	pub fn device_id(&self) -> Option<String> {
		self.inner.identity.device_id()
	}

	/// Current session id, `-1` when no session is active.
	pub fn session_id(&self) -> i64 {
		*self.inner.session_id.lock()
	}

	/// Starts a session at `timestamp`, or ends the current one when
	/// `timestamp` is negative.
	pub fn set_session_id(&self, timestamp: i64) {
		self.submit(Job::SetSessionId(timestamp));
	}

	/// Clears the user id and rotates the device id.
	pub fn reset(&self) {
		self.submit(Job::Reset);
	}

	pub fn set_opt_out(&self, opt_out: bool) {
		self.submit(Job::SetOptOut(opt_out));
	}

	pub fn opt_out(&self) -> bool {
		self.inner.identity.opt_out()
	}

	/// While offline nothing is uploaded. Going back online flushes.
	pub fn set_offline(&self, offline: bool) {
		self.submit(Job::SetOffline(offline));
	}

	pub fn on_enter_foreground(&self, timestamp: i64) {
		self.submit(Job::EnterForeground(timestamp));
	}

	pub fn on_exit_foreground(&self, timestamp: i64) {
		self.submit(Job::ExitForeground(timestamp));
	}

	pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
		self.submit(Job::AddPlugin(plugin));
	}

	/// Removes a plugin previously passed to [`Analytics::add_plugin`].
	pub fn remove_plugin(&self, plugin: &Arc<dyn Plugin>) {
		self.submit(Job::RemovePlugin(plugin.clone()));
	}

	/// Requests an upload of everything queued.
	pub fn flush(&self) {
		self.submit(Job::Flush(None));
	}

	/// Flushes and waits until the upload lane drains, the client goes
	/// offline, or a retry is scheduled after a failure.
	pub async fn flush_and_wait(&self) -> Result<()> {
		self.check_closed()?;
		let (tx, rx) = oneshot::channel();
		self.inner.jobs.send(Job::Flush(Some(tx)))?;
		rx.await.map_err(|_| EventsError::ClientShutdown)
	}

	pub fn delivery_stats(&self) -> DeliveryStats {
		self.inner.diagnostics.stats()
	}

	/// Stops timers, sends pending identifies and, when
	/// `flush_events_on_close` is set, attempts a final upload. Calling it
	/// again is a no-op.
	pub async fn shutdown(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		info!(instance = %self.inner.config.instance_name, "Shutting down analytics client");
		let (tx, rx) = oneshot::channel();
		if self.inner.jobs.send(Job::Shutdown(tx)).is_ok() {
			let _ = rx.await;
		}

		let worker = self.inner.worker.lock().take();
		if let Some(worker) = worker {
			if let Err(e) = worker.await {
				warn!(error = %e, "Event worker did not stop cleanly");
			}
		}

		info!("Analytics client shutdown complete");
		Ok(())
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			return Err(EventsError::ClientShutdown);
		}
		Ok(())
	}

	fn submit(&self, job: Job) {
		if self.check_closed().is_err() || self.inner.jobs.send(job).is_err() {
			debug!("Client is shut down, ignoring call");
		}
	}
}

fn open_storage(config: &Configuration) -> Result<(Arc<dyn Storage>, Arc<dyn Storage>)> {
	match &config.storage {
		StorageConfig::InMemory => Ok((
			Arc::new(InMemoryStorage::new()),
			Arc::new(InMemoryStorage::new()),
		)),
		StorageConfig::Custom { events, identify } => Ok((events.clone(), identify.clone())),
		StorageConfig::Default | StorageConfig::Directory(_) => {
			let root = config.storage_root().ok_or_else(|| {
				EventsError::InvalidConfiguration("no storage directory available".into())
			})?;
			debug!(root = %root.display(), "Opening file storage");
			let events = FileStorage::open(root.join("events"), config.max_block_bytes)?;
			let identify = FileStorage::open(root.join("identify"), config.max_block_bytes)?;
			Ok((Arc::new(events), Arc::new(identify)))
		}
	}
}
