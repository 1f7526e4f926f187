// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Well-known event types, endpoints and delivery defaults.

use std::time::Duration;

pub const SESSION_START_EVENT: &str = "session_start";
pub const SESSION_END_EVENT: &str = "session_end";
pub const IDENTIFY_EVENT: &str = "$identify";
pub const GROUP_IDENTIFY_EVENT: &str = "$groupidentify";
pub const REVENUE_EVENT: &str = "revenue_amount";

pub const SDK_LIBRARY: &str = "loom-events-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_INSTANCE: &str = "$default_instance";

pub const DEFAULT_API_HOST: &str = "https://api2.amplitude.com/2/httpapi";
pub const EU_DEFAULT_API_HOST: &str = "https://api.eu.amplitude.com/2/httpapi";
pub const BATCH_API_HOST: &str = "https://api2.amplitude.com/batch";
pub const EU_BATCH_API_HOST: &str = "https://api.eu.amplitude.com/batch";

pub const FLUSH_QUEUE_SIZE: usize = 30;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const FLUSH_MAX_RETRIES: u32 = 6;
pub const MIN_TIME_BETWEEN_SESSIONS_MILLIS: i64 = 300_000;
pub const IDENTIFY_BATCH_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_IDENTIFY_BATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Size at which the open block is closed and a new one started.
pub const MAX_BLOCK_BYTES: u64 = 975_000;

/// Device ids that some platforms hand out when the real one is unavailable.
pub const INVALID_DEVICE_IDS: &[&str] = &[
	"00000000-0000-0000-0000-000000000000",
	"9774d56d682e549c",
];
