// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Builder for user-property operations.
//!
//! An [`Identify`] collects operations such as `$set` or `$add` keyed by
//! property name and becomes the `user_properties` of an `$identify` event
//! (or the `group_properties` of a `$groupidentify` event).

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::constants::{GROUP_IDENTIFY_EVENT, IDENTIFY_EVENT};
use crate::event::{Event, Properties};

/// Placeholder value used by operations that carry no value.
pub const UNSET_VALUE: &str = "-";

/// A user-property operation understood by the collection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifyOperation {
	Set,
	SetOnce,
	Add,
	Append,
	ClearAll,
	Prepend,
	Unset,
	PreInsert,
	PostInsert,
	Remove,
}

impl IdentifyOperation {
	pub const ALL: [IdentifyOperation; 10] = [
		IdentifyOperation::Set,
		IdentifyOperation::SetOnce,
		IdentifyOperation::Add,
		IdentifyOperation::Append,
		IdentifyOperation::ClearAll,
		IdentifyOperation::Prepend,
		IdentifyOperation::Unset,
		IdentifyOperation::PreInsert,
		IdentifyOperation::PostInsert,
		IdentifyOperation::Remove,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			IdentifyOperation::Set => "$set",
			IdentifyOperation::SetOnce => "$set_once",
			IdentifyOperation::Add => "$add",
			IdentifyOperation::Append => "$append",
			IdentifyOperation::ClearAll => "$clearAll",
			IdentifyOperation::Prepend => "$prepend",
			IdentifyOperation::Unset => "$unset",
			IdentifyOperation::PreInsert => "$preInsert",
			IdentifyOperation::PostInsert => "$postInsert",
			IdentifyOperation::Remove => "$remove",
		}
	}

	pub fn from_key(key: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|op| op.as_str() == key)
	}
}

impl std::fmt::Display for IdentifyOperation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Accumulates user-property operations.
///
/// Each property may be touched by only one operation; later attempts on the
/// same property are ignored with a warning. Once `$clearAll` is present no
/// further operations are accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identify {
	properties: Properties,
	touched: HashSet<String>,
}

impl Identify {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Set, property.into(), value.into())
	}

	pub fn set_once(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::SetOnce, property.into(), value.into())
	}

	pub fn add(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Add, property.into(), value.into())
	}

	pub fn append(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Append, property.into(), value.into())
	}

	pub fn prepend(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Prepend, property.into(), value.into())
	}

	pub fn pre_insert(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::PreInsert, property.into(), value.into())
	}

	pub fn post_insert(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::PostInsert, property.into(), value.into())
	}

	pub fn remove(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Remove, property.into(), value.into())
	}

	pub fn unset(self, property: impl Into<String>) -> Self {
		self.apply(
			IdentifyOperation::Unset,
			property.into(),
			Value::from(UNSET_VALUE),
		)
	}

	/// Wipes every user property server-side. Discards operations added so far.
	pub fn clear_all(mut self) -> Self {
		self.properties.clear();
		self.touched.clear();
		self.properties.insert(
			IdentifyOperation::ClearAll.as_str().to_string(),
			Value::from(UNSET_VALUE),
		);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.properties.is_empty()
	}

	pub fn properties(&self) -> &Properties {
		&self.properties
	}

	/// Builds an `$identify` event carrying these operations.
	pub fn into_event(self) -> Event {
		Event::new(IDENTIFY_EVENT).with_user_properties(self.properties)
	}

	/// Builds a `$groupidentify` event for one group.
	pub fn into_group_event(self, group_type: &str, group_name: &str) -> Event {
		let mut groups = Properties::new();
		groups.insert(group_type.to_string(), Value::from(group_name));
		let mut event = Event::new(GROUP_IDENTIFY_EVENT);
		event.groups = Some(groups);
		event.group_properties = Some(self.properties);
		event
	}

	fn apply(mut self, op: IdentifyOperation, property: String, value: Value) -> Self {
		if property.is_empty() {
			warn!(operation = %op, "Ignoring identify operation on empty property name");
			return self;
		}
		if value.is_null() {
			warn!(operation = %op, property = %property, "Ignoring identify operation with null value");
			return self;
		}
		if self
			.properties
			.contains_key(IdentifyOperation::ClearAll.as_str())
		{
			warn!(operation = %op, "Identify already contains $clearAll, ignoring operation");
			return self;
		}
		if !self.touched.insert(property.clone()) {
			warn!(operation = %op, property = %property, "Property already used by another operation, ignoring");
			return self;
		}

		let entry = self
			.properties
			.entry(op.as_str().to_string())
			.or_insert_with(|| Value::Object(Properties::new()));
		if let Value::Object(map) = entry {
			map.insert(property, value);
		}
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn set_groups_properties_under_operation() {
		let identify = Identify::new().set("plan", "pro").set("seats", 3);
		assert_eq!(
			Value::Object(identify.properties().clone()),
			json!({"$set": {"plan": "pro", "seats": 3}})
		);
	}

	#[test]
	fn mixed_operations_use_separate_keys() {
		let identify = Identify::new()
			.set("a", 1)
			.add("counter", 2)
			.append("tags", "x")
			.unset("old");
		let props = Value::Object(identify.properties().clone());
		assert_eq!(props["$set"]["a"], 1);
		assert_eq!(props["$add"]["counter"], 2);
		assert_eq!(props["$append"]["tags"], "x");
		assert_eq!(props["$unset"]["old"], "-");
	}

	#[test]
	fn property_used_twice_is_ignored() {
		let identify = Identify::new().set("a", 1).add("a", 5);
		let props = Value::Object(identify.properties().clone());
		assert_eq!(props, json!({"$set": {"a": 1}}));
	}

	#[test]
	fn null_value_is_ignored() {
		let identify = Identify::new().set("a", Value::Null);
		assert!(identify.is_empty());
	}

	#[test]
	fn clear_all_discards_and_blocks_further_operations() {
		let identify = Identify::new().set("a", 1).clear_all().set("b", 2);
		let props = Value::Object(identify.properties().clone());
		assert_eq!(props, json!({"$clearAll": "-"}));
	}

	#[test]
	fn into_event_sets_type_and_user_properties() {
		let event = Identify::new().set("a", "1").into_event();
		assert_eq!(event.event_type, IDENTIFY_EVENT);
		assert_eq!(
			event.user_operation(IdentifyOperation::Set),
			Some(&json!({"a": "1"}))
		);
	}

	#[test]
	fn into_group_event_sets_groups_and_group_properties() {
		let event = Identify::new()
			.set("size", 10)
			.into_group_event("org", "acme");
		assert_eq!(event.event_type, GROUP_IDENTIFY_EVENT);
		assert_eq!(event.groups, json!({"org": "acme"}).as_object().cloned());
		assert_eq!(
			event.group_properties,
			json!({"$set": {"size": 10}}).as_object().cloned()
		);
		assert!(event.user_properties.is_none());
	}

	#[test]
	fn operation_keys_round_trip() {
		for op in IdentifyOperation::ALL {
			assert_eq!(IdentifyOperation::from_key(op.as_str()), Some(op));
		}
		assert_eq!(IdentifyOperation::from_key("$bogus"), None);
	}
}
