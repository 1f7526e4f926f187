// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The serialized execution context.
//!
//! Every mutation of session, identity, plugin and queue state happens on
//! one task that drains [`Job`]s in order. Uploads and timers run elsewhere
//! and report back by posting jobs.

use std::sync::Arc;

use loom_events_core::constants::SESSION_START_EVENT;
use loom_events_core::Event;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::{EventsError, Result, SendError};
use crate::pipeline::EventPipeline;
use crate::plugin::{Plugin, Timeline};
use crate::plugins::DestinationPlugin;
use crate::session::SessionManager;
use crate::state::IdentityStore;
use crate::storage::BlockId;

/// Work item for the worker.
pub(crate) enum Job {
	Process(Event),
	Flush(Option<oneshot::Sender<()>>),
	EnterForeground(i64),
	ExitForeground(i64),
	SetSessionId(i64),
	SetUserId(Option<String>),
	SetDeviceId(String),
	Reset,
	SetOptOut(bool),
	SetOffline(bool),
	AddPlugin(Arc<dyn Plugin>),
	RemovePlugin(Arc<dyn Plugin>),
	FlushTick,
	UploadFinished {
		block: BlockId,
		raw: String,
		result: std::result::Result<u16, SendError>,
	},
	ResumeUpload,
	IdentifyBatchElapsed,
	Shutdown(oneshot::Sender<()>),
}

/// Sending half of the worker's queue.
#[derive(Clone)]
pub(crate) struct JobQueue {
	tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub fn send(&self, job: Job) -> Result<()> {
		self.tx.send(job).map_err(|_| EventsError::ClientShutdown)
	}
}

pub(crate) struct Worker {
	config: Arc<Configuration>,
	timeline: Timeline,
	sessions: SessionManager,
	pipeline: Arc<EventPipeline>,
	destination: Arc<DestinationPlugin>,
	identity: Arc<IdentityStore>,
	jobs: mpsc::UnboundedReceiver<Job>,
	in_foreground: bool,
}

impl Worker {
	pub fn new(
		config: Arc<Configuration>,
		timeline: Timeline,
		sessions: SessionManager,
		pipeline: Arc<EventPipeline>,
		destination: Arc<DestinationPlugin>,
		identity: Arc<IdentityStore>,
		jobs: mpsc::UnboundedReceiver<Job>,
	) -> Self {
		Self {
			config,
			timeline,
			sessions,
			pipeline,
			destination,
			identity,
			jobs,
			in_foreground: false,
		}
	}

	pub async fn run(mut self) {
		info!(instance = %self.config.instance_name, "Starting event worker");

		while let Some(job) = self.jobs.recv().await {
			match job {
				Job::Shutdown(reply) => {
					self.shutdown(reply).await;
					break;
				}
				job => self.handle(job),
			}
		}

		info!(instance = %self.config.instance_name, "Event worker stopped");
	}

	fn handle(&mut self, job: Job) {
		let session_before = self.sessions.session_id();

		match job {
			Job::Process(event) => {
				if self.identity.opt_out() {
					debug!(event_type = %event.event_type, "Opted out, ignoring event");
				} else {
					self.timeline
						.process(&mut self.sessions, event, self.in_foreground);
				}
			}
			Job::Flush(waiter) => {
				if let Some(waiter) = waiter {
					self.pipeline.add_flush_waiter(waiter);
				}
				self.timeline.apply(|p| p.flush());
			}
			Job::FlushTick => self.pipeline.flush(),
			Job::EnterForeground(timestamp) => {
				self.in_foreground = true;
				if !self.identity.opt_out() {
					let marker = Event::new(SESSION_START_EVENT).with_timestamp(timestamp);
					self.timeline.process(&mut self.sessions, marker, false);
				}
			}
			Job::ExitForeground(timestamp) => {
				self.in_foreground = false;
				self.sessions.set_last_event_time(timestamp);
				if self.config.flush_events_on_close {
					self.timeline.apply(|p| p.flush());
				}
			}
			Job::SetSessionId(timestamp) => {
				let mut markers = if timestamp < 0 {
					self.sessions.end_current_session()
				} else {
					self.sessions.start_new_session(timestamp)
				};
				if !self.identity.opt_out() {
					self.sessions.assign_event_ids(&mut markers);
					for marker in markers {
						self.timeline.dispatch(marker);
					}
				}
			}
			Job::SetUserId(user_id) => {
				self.identity.set_user_id(user_id.clone());
				self.timeline
					.apply(|p| p.on_user_id_changed(user_id.as_deref()));
			}
			Job::SetDeviceId(device_id) => {
				if self.identity.set_device_id(device_id.clone()) {
					self.timeline.apply(|p| p.on_device_id_changed(&device_id));
				}
			}
			Job::Reset => {
				let device_id = self.identity.reset();
				self.timeline.apply(|p| {
					p.on_user_id_changed(None);
					p.on_device_id_changed(&device_id);
				});
			}
			Job::SetOptOut(opt_out) => {
				self.identity.set_opt_out(opt_out);
				self.timeline.apply(|p| p.on_opt_out_changed(opt_out));
			}
			Job::SetOffline(offline) => {
				self.pipeline.set_offline(offline);
				if !offline {
					info!("Back online, flushing");
					self.pipeline.flush();
				}
			}
			Job::AddPlugin(plugin) => {
				debug!(plugin = plugin.name(), "Adding plugin");
				plugin.setup(&self.config);
				self.timeline.add(plugin);
				debug!(plugins = self.timeline.plugin_count(), "Plugin added");
			}
			Job::RemovePlugin(plugin) => {
				if self.timeline.remove(&plugin) {
					debug!(plugin = plugin.name(), "Removed plugin");
					plugin.teardown();
				}
			}
			Job::UploadFinished { block, raw, result } => {
				self.pipeline.on_upload_finished(block, raw, result);
			}
			Job::ResumeUpload => self.pipeline.resume_upload(),
			Job::IdentifyBatchElapsed => self.destination.on_identify_timer(),
			Job::Shutdown(reply) => {
				let _ = reply.send(());
			}
		}

		let session_after = self.sessions.session_id();
		if session_after != session_before {
			self.timeline
				.apply(|p| p.on_session_id_changed(session_after));
		}
	}

	/// Stops timers, sends parked identifies and, when configured, makes a
	/// final delivery attempt while still applying upload results.
	async fn shutdown(&mut self, reply: oneshot::Sender<()>) {
		info!(
			session_id = self.sessions.session_id(),
			last_event_id = self.sessions.last_event_id(),
			last_event_time = self.sessions.last_event_time(),
			"Shutting down event worker"
		);
		self.pipeline.stop();
		self.destination.transfer_pending_identify();

		if self.config.flush_events_on_close {
			let (tx, mut flushed) = oneshot::channel();
			self.pipeline.add_flush_waiter(tx);
			self.pipeline.begin_close();
			self.pipeline.flush();

			let mut replies = Vec::new();
			loop {
				tokio::select! {
					_ = &mut flushed => break,
					job = self.jobs.recv() => match job {
						Some(Job::UploadFinished { block, raw, result }) => {
							self.pipeline.on_upload_finished(block, raw, result);
						}
						Some(Job::ResumeUpload) => self.pipeline.resume_upload(),
						Some(Job::Shutdown(reply)) => replies.push(reply),
						Some(_) => debug!("Ignoring job received during shutdown"),
						None => break,
					},
				}
			}
			for reply in replies {
				let _ = reply.send(());
			}
		} else {
			self.pipeline.begin_close();
		}

		self.timeline.apply(|p| p.teardown());
		let _ = reply.send(());
	}
}
