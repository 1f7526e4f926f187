// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use loom_events_core::constants::{SDK_LIBRARY, SDK_VERSION};
use loom_events_core::{Event, IngestionMetadata, Plan};

use crate::config::Configuration;
use crate::plugin::{Plugin, PluginKind};
use crate::state::IdentityStore;

/// Fills identity and SDK context on every event. Values the caller already
/// set are kept.
pub(crate) struct ContextPlugin {
	identity: Arc<IdentityStore>,
	library: String,
	partner_id: Option<String>,
	plan: Option<Plan>,
	ingestion_metadata: Option<IngestionMetadata>,
}

impl ContextPlugin {
	pub fn new(config: &Configuration, identity: Arc<IdentityStore>) -> Self {
		Self {
			identity,
			library: format!("{SDK_LIBRARY}/{SDK_VERSION}"),
			partner_id: config.partner_id.clone(),
			plan: config.plan.clone(),
			ingestion_metadata: config.ingestion_metadata.clone(),
		}
	}
}

impl Plugin for ContextPlugin {
	fn kind(&self) -> PluginKind {
		PluginKind::Before
	}

	fn name(&self) -> &str {
		"context"
	}

	fn execute(&self, mut event: Event) -> Option<Event> {
		if event.insert_id.is_none() {
			event.insert_id = Some(uuid::Uuid::new_v4().to_string());
		}
		if event.library.is_none() {
			event.library = Some(self.library.clone());
		}

		let identity = self.identity.identity();
		if event.user_id.is_none() {
			event.user_id = identity.user_id;
		}
		if event.device_id.is_none() {
			event.device_id = identity.device_id;
		}

		if event.partner_id.is_none() {
			event.partner_id = self.partner_id.clone();
		}
		if event.plan.is_none() {
			event.plan = self.plan.clone();
		}
		if event.ingestion_metadata.is_none() {
			event.ingestion_metadata = self.ingestion_metadata.clone();
		}
		if event.platform.is_none() {
			event.platform = Some(std::env::consts::ARCH.to_string());
		}
		if event.os_name.is_none() {
			event.os_name = Some(std::env::consts::OS.to_string());
		}
		Some(event)
	}
}
