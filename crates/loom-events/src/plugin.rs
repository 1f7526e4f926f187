// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Plugin stages.
//!
//! Every event passes through three ordered stages: `before`, `enrichment`
//! and `destination`. A plugin in the first two stages may rewrite the event
//! or drop it by returning `None`. Destinations are sinks: each one sees the
//! same event and cannot change what the next destination receives.
//! `Utility` plugins never see events; they only receive lifecycle
//! notifications.

use std::sync::Arc;

use loom_events_core::{Event, EventKind};
use parking_lot::Mutex;

use crate::config::Configuration;
use crate::session::SessionManager;

/// Stage a plugin is registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
	Before,
	Enrichment,
	Destination,
	Utility,
}

/// A pipeline extension.
///
/// All hooks have no-op defaults, so implementations override only what
/// they need.
pub trait Plugin: Send + Sync {
	fn kind(&self) -> PluginKind;

	fn name(&self) -> &str {
		std::any::type_name::<Self>()
	}

	/// Called once when the plugin is added.
	fn setup(&self, _config: &Configuration) {}

	/// Transforms an event. Returning `None` drops it from the stage.
	fn execute(&self, event: Event) -> Option<Event> {
		Some(event)
	}

	/// Called once when the plugin is removed or the client shuts down.
	fn teardown(&self) {}

	fn on_user_id_changed(&self, _user_id: Option<&str>) {}

	fn on_device_id_changed(&self, _device_id: &str) {}

	fn on_session_id_changed(&self, _session_id: i64) {}

	fn on_opt_out_changed(&self, _opt_out: bool) {}

	fn flush(&self) {}

	/// Opts into per-kind dispatch through [`EventPlugin`].
	fn as_event_plugin(&self) -> Option<&dyn EventPlugin> {
		None
	}
}

/// A plugin with one handler per event kind.
///
/// Implementors return `Some(self)` from [`Plugin::as_event_plugin`]; the
/// stage then calls the handler matching [`Event::kind`] instead of
/// [`Plugin::execute`].
pub trait EventPlugin: Plugin {
	fn track(&self, event: Event) -> Option<Event> {
		Some(event)
	}

	fn identify(&self, event: Event) -> Option<Event> {
		Some(event)
	}

	fn group_identify(&self, event: Event) -> Option<Event> {
		Some(event)
	}

	fn revenue(&self, event: Event) -> Option<Event> {
		Some(event)
	}
}

fn run_plugin(plugin: &dyn Plugin, event: Event) -> Option<Event> {
	match plugin.as_event_plugin() {
		Some(handler) => match event.kind() {
			EventKind::Track => handler.track(event),
			EventKind::Identify => handler.identify(event),
			EventKind::GroupIdentify => handler.group_identify(event),
			EventKind::Revenue => handler.revenue(event),
		},
		None => plugin.execute(event),
	}
}

/// Ordered plugins of a single stage.
#[derive(Default)]
pub(crate) struct Mediator {
	plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

impl Mediator {
	pub fn add(&self, plugin: Arc<dyn Plugin>) {
		self.plugins.lock().push(plugin);
	}

	pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
		let mut plugins = self.plugins.lock();
		let before = plugins.len();
		plugins.retain(|p| !Arc::ptr_eq(p, plugin));
		plugins.len() != before
	}

	/// Runs the stage over a snapshot of its plugins, so plugins may add or
	/// remove others while executing.
	pub fn execute(&self, event: Event) -> Option<Event> {
		let plugins = self.plugins.lock().clone();
		let mut current = event;
		for plugin in plugins {
			if plugin.kind() == PluginKind::Destination {
				run_plugin(plugin.as_ref(), current.clone());
			} else {
				current = run_plugin(plugin.as_ref(), current)?;
			}
		}
		Some(current)
	}

	pub fn apply(&self, f: &mut dyn FnMut(&dyn Plugin)) {
		let plugins = self.plugins.lock().clone();
		for plugin in plugins {
			f(plugin.as_ref());
		}
	}

	pub fn len(&self) -> usize {
		self.plugins.lock().len()
	}
}

/// Routes events through the stages in order.
#[derive(Default)]
pub(crate) struct Timeline {
	before: Mediator,
	enrichment: Mediator,
	destination: Mediator,
	utility: Mediator,
}

impl Timeline {
	fn mediator(&self, kind: PluginKind) -> &Mediator {
		match kind {
			PluginKind::Before => &self.before,
			PluginKind::Enrichment => &self.enrichment,
			PluginKind::Destination => &self.destination,
			PluginKind::Utility => &self.utility,
		}
	}

	pub fn add(&self, plugin: Arc<dyn Plugin>) {
		self.mediator(plugin.kind()).add(plugin);
	}

	pub fn remove(&self, plugin: &Arc<dyn Plugin>) -> bool {
		self.mediator(plugin.kind()).remove(plugin)
	}

	/// Stamps session context, then dispatches the synthesized markers
	/// followed by the event itself.
	pub fn process(&self, sessions: &mut SessionManager, event: Event, in_foreground: bool) {
		for event in sessions.process_event(event, in_foreground) {
			self.dispatch(event);
		}
	}

	pub fn dispatch(&self, event: Event) {
		let Some(event) = self.before.execute(event) else {
			return;
		};
		let Some(event) = self.enrichment.execute(event) else {
			return;
		};
		self.destination.execute(event);
	}

	/// Calls `f` on every plugin of every stage.
	pub fn apply(&self, mut f: impl FnMut(&dyn Plugin)) {
		for kind in [
			PluginKind::Before,
			PluginKind::Enrichment,
			PluginKind::Destination,
			PluginKind::Utility,
		] {
			self.mediator(kind).apply(&mut f);
		}
	}

	pub fn plugin_count(&self) -> usize {
		[&self.before, &self.enrichment, &self.destination, &self.utility]
			.iter()
			.map(|m| m.len())
			.sum()
	}
}
