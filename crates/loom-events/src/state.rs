// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity and opt-out state.
//!
//! Written only from the worker; read from anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use loom_events_core::constants::INVALID_DEVICE_IDS;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::{Storage, StorageKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Identity {
	pub user_id: Option<String>,
	pub device_id: Option<String>,
}

pub(crate) struct IdentityStore {
	storage: Arc<dyn Storage>,
	identity: RwLock<Identity>,
	opt_out: AtomicBool,
}

impl IdentityStore {
	/// Restores identity and opt-out, generating a device id when none valid
	/// was persisted.
	pub fn load(storage: Arc<dyn Storage>, default_opt_out: bool) -> Self {
		let user_id = storage.read_string(StorageKey::UserId);
		let device_id = storage
			.read_string(StorageKey::DeviceId)
			.filter(|id| is_valid_device_id(id));
		let opt_out = storage.read_bool(StorageKey::OptOut).unwrap_or(default_opt_out);

		let store = Self {
			storage,
			identity: RwLock::new(Identity { user_id, device_id }),
			opt_out: AtomicBool::new(opt_out),
		};
		if store.identity.read().device_id.is_none() {
			store.set_device_id(generate_device_id());
		}
		store
	}

	pub fn identity(&self) -> Identity {
		self.identity.read().clone()
	}

	pub fn user_id(&self) -> Option<String> {
		self.identity.read().user_id.clone()
	}

	pub fn device_id(&self) -> Option<String> {
		self.identity.read().device_id.clone()
	}

	pub fn set_user_id(&self, user_id: Option<String>) {
		debug!(user_id = ?user_id, "Setting user id");
		self.identity.write().user_id = user_id.clone();
		self.persist(StorageKey::UserId, user_id.map(Value::from));
	}

	/// Invalid ids are ignored. Returns whether the id was applied.
	pub fn set_device_id(&self, device_id: String) -> bool {
		if !is_valid_device_id(&device_id) {
			warn!(device_id = %device_id, "Ignoring invalid device id");
			return false;
		}
		debug!(device_id = %device_id, "Setting device id");
		self.identity.write().device_id = Some(device_id.clone());
		self.persist(StorageKey::DeviceId, Some(Value::from(device_id)));
		true
	}

	/// Clears the user id and rotates the device id. Returns the new device id.
	pub fn reset(&self) -> String {
		self.set_user_id(None);
		let device_id = generate_device_id();
		self.set_device_id(device_id.clone());
		device_id
	}

	pub fn opt_out(&self) -> bool {
		self.opt_out.load(Ordering::SeqCst)
	}

	pub fn set_opt_out(&self, opt_out: bool) {
		self.opt_out.store(opt_out, Ordering::SeqCst);
		self.persist(StorageKey::OptOut, Some(Value::from(opt_out)));
	}

	fn persist(&self, key: StorageKey, value: Option<Value>) {
		if let Err(e) = self.storage.write(key, value) {
			warn!(key = key.as_str(), error = %e, "Failed to persist identity");
		}
	}
}

fn is_valid_device_id(device_id: &str) -> bool {
	!device_id.is_empty() && !INVALID_DEVICE_IDS.contains(&device_id)
}

fn generate_device_id() -> String {
	uuid::Uuid::new_v4().to_string()
}
