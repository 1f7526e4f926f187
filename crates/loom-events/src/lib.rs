// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable event delivery for Loom analytics.
//!
//! Events pass through a staged plugin timeline, are stamped with session
//! and sequence ids, persisted to disk in blocks, and uploaded one block at a
//! time. The client survives restarts: anything persisted before a crash is
//! delivered on the next launch.
//!
//! # Features
//!
//! - **Plugin timeline**: before, enrichment, destination and utility stages
//! - **Sessions**: automatic `session_start`/`session_end` markers
//! - **Durable queue**: file-backed blocks, split on oversized payloads
//! - **Response handling**: partial drops on 400, splitting on 413, backoff
//!   and offline mode after repeated failures
//! - **Identify batching**: `$set`-only identifies are merged into one event
//!
//! # Example
//!
//! ```ignore
//! use loom_events::{Analytics, Configuration, Identify};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let analytics = Analytics::new(Configuration::builder("api-key").build()?)?;
//!
//!     analytics.set_user_id(Some("user-123".into()));
//!     analytics.track_event("app_opened", None);
//!     analytics.identify(Identify::new().set("plan", "pro"));
//!
//!     analytics.flush_and_wait().await?;
//!     analytics.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod diagnostics;
mod error;
mod http;
mod identify;
mod pipeline;
mod plugin;
mod plugins;
mod response;
mod session;
mod state;
mod storage;
mod timer;
mod worker;

pub use client::Analytics;
pub use config::{Configuration, ConfigurationBuilder, ServerZone, StorageConfig};
pub use diagnostics::DeliveryStats;
pub use error::{EventsError, Result, SendError};
pub use http::HttpClient;
pub use pipeline::BatchSender;
pub use plugin::{EventPlugin, Plugin, PluginKind};
pub use storage::{BlockId, FileStorage, InMemoryStorage, Storage, StorageError, StorageKey};

// Re-export core types for convenience
pub use loom_events_core::{
	constants, BadRequestBody, Event, EventCallback, EventKind, Identify, IdentifyOperation,
	IngestionMetadata, Plan, Properties, Revenue,
};
