// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client builder with a consistent User-Agent header.

use reqwest::{Client, ClientBuilder};

const SDK_NAME: &str = "loom-events";
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creates a new HTTP client builder with the standard User-Agent header.
///
/// Callers customize the rest (timeouts, TLS) before building.
///
/// # Example
/// ```ignore
/// let client = loom_common_http::builder()
///     .timeout(Duration::from_secs(60))
///     .build()?;
/// ```
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Returns the standard User-Agent string.
///
/// Format: `loom-events/{os}-{arch}/{version}`, e.g.
/// `loom-events/linux-x86_64/0.1.0`.
pub fn user_agent() -> String {
	format!(
		"{SDK_NAME}/{}-{}/{SDK_VERSION}",
		std::env::consts::OS,
		std::env::consts::ARCH
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_names_sdk_platform_and_version() {
		let ua = user_agent();
		let parts: Vec<&str> = ua.split('/').collect();
		assert_eq!(parts.len(), 3);
		assert_eq!(parts[0], "loom-events");
		assert!(parts[1].contains(std::env::consts::ARCH));
		assert_eq!(parts[2], SDK_VERSION);
	}

	#[test]
	fn builder_produces_client() {
		assert!(builder().build().is_ok());
	}
}
