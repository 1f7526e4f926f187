// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Builder for revenue events.

use serde_json::Value;

use crate::constants::REVENUE_EVENT;
use crate::event::{Event, Properties};

const PRODUCT_ID: &str = "$productId";
const QUANTITY: &str = "$quantity";
const PRICE: &str = "$price";
const REVENUE_TYPE: &str = "$revenueType";
const RECEIPT: &str = "$receipt";
const RECEIPT_SIG: &str = "$receiptSig";
const REVENUE: &str = "$revenue";

/// A purchase to be reported as a `revenue_amount` event.
///
/// A revenue is only valid once it has a price.
#[derive(Debug, Clone, PartialEq)]
pub struct Revenue {
	product_id: Option<String>,
	quantity: i64,
	price: Option<f64>,
	revenue: Option<f64>,
	revenue_type: Option<String>,
	receipt: Option<String>,
	receipt_sig: Option<String>,
	properties: Properties,
}

impl Default for Revenue {
	fn default() -> Self {
		Self {
			product_id: None,
			quantity: 1,
			price: None,
			revenue: None,
			revenue_type: None,
			receipt: None,
			receipt_sig: None,
			properties: Properties::new(),
		}
	}
}

impl Revenue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Empty product ids are ignored.
	pub fn product_id(mut self, product_id: impl Into<String>) -> Self {
		let product_id = product_id.into();
		if !product_id.is_empty() {
			self.product_id = Some(product_id);
		}
		self
	}

	/// Non-positive quantities are ignored; the default is 1.
	pub fn quantity(mut self, quantity: i64) -> Self {
		if quantity > 0 {
			self.quantity = quantity;
		}
		self
	}

	pub fn price(mut self, price: f64) -> Self {
		self.price = Some(price);
		self
	}

	pub fn revenue(mut self, revenue: f64) -> Self {
		self.revenue = Some(revenue);
		self
	}

	pub fn revenue_type(mut self, revenue_type: impl Into<String>) -> Self {
		self.revenue_type = Some(revenue_type.into());
		self
	}

	pub fn receipt(mut self, receipt: impl Into<String>, signature: impl Into<String>) -> Self {
		self.receipt = Some(receipt.into());
		self.receipt_sig = Some(signature.into());
		self
	}

	pub fn properties(mut self, properties: Properties) -> Self {
		self.properties = properties;
		self
	}

	pub fn is_valid(&self) -> bool {
		self.price.is_some()
	}

	pub fn into_event(self) -> Event {
		let mut props = self.properties;
		if let Some(product_id) = self.product_id {
			props.insert(PRODUCT_ID.to_string(), Value::from(product_id));
		}
		props.insert(QUANTITY.to_string(), Value::from(self.quantity));
		if let Some(price) = self.price {
			props.insert(PRICE.to_string(), Value::from(price));
		}
		if let Some(revenue_type) = self.revenue_type {
			props.insert(REVENUE_TYPE.to_string(), Value::from(revenue_type));
		}
		if let Some(receipt) = self.receipt {
			props.insert(RECEIPT.to_string(), Value::from(receipt));
		}
		if let Some(sig) = self.receipt_sig {
			props.insert(RECEIPT_SIG.to_string(), Value::from(sig));
		}
		if let Some(revenue) = self.revenue {
			props.insert(REVENUE.to_string(), Value::from(revenue));
		}
		Event::new(REVENUE_EVENT).with_event_properties(props)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn requires_price() {
		assert!(!Revenue::new().product_id("sku").is_valid());
		assert!(Revenue::new().price(9.99).is_valid());
	}

	#[test]
	fn ignores_invalid_inputs() {
		let revenue = Revenue::new().product_id("").quantity(0);
		let event = revenue.into_event();
		let props = event.event_properties.unwrap();
		assert!(props.get(PRODUCT_ID).is_none());
		assert_eq!(props[QUANTITY], 1);
	}

	#[test]
	fn into_event_uses_dollar_keys() {
		let mut extra = Properties::new();
		extra.insert("campaign".to_string(), json!("spring"));
		let event = Revenue::new()
			.product_id("sku-1")
			.quantity(2)
			.price(4.5)
			.revenue_type("purchase")
			.receipt("r", "s")
			.properties(extra)
			.into_event();
		assert_eq!(event.event_type, REVENUE_EVENT);
		assert_eq!(
			Value::Object(event.event_properties.unwrap()),
			json!({
				"campaign": "spring",
				"$productId": "sku-1",
				"$quantity": 2,
				"$price": 4.5,
				"$revenueType": "purchase",
				"$receipt": "r",
				"$receiptSig": "s",
			})
		);
	}
}
