// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the event delivery SDK.

use loom_common_http::{is_retryable_status, RetryableError};
use thiserror::Error;

use crate::storage::StorageError;

/// Event delivery SDK errors.
#[derive(Debug, Error)]
pub enum EventsError {
	/// API key is missing.
	#[error("invalid API key: must not be empty")]
	InvalidApiKey,

	/// A configuration value is out of range.
	#[error("invalid configuration: {0}")]
	InvalidConfiguration(String),

	/// The HTTP client could not be constructed.
	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),

	/// Persisted storage could not be opened or written.
	#[error("storage error: {0}")]
	Storage(#[from] StorageError),

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, EventsError>;

/// Failure of a single block upload.
#[derive(Debug, Error)]
pub enum SendError {
	/// The request never produced a response.
	#[error("HTTP request failed: {0}")]
	Transport(#[from] reqwest::Error),

	/// The server answered with a non-success status.
	#[error("server error ({status}): {body}")]
	Status { status: u16, body: String },

	/// The block was not a valid JSON payload and was never sent.
	#[error("invalid payload: {0}")]
	InvalidPayload(String),
}

impl SendError {
	pub fn status(&self) -> Option<u16> {
		match self {
			SendError::Status { status, .. } => Some(*status),
			_ => None,
		}
	}
}

impl RetryableError for SendError {
	fn is_retryable(&self) -> bool {
		match self {
			SendError::Transport(e) => e.is_retryable(),
			SendError::Status { status, .. } => is_retryable_status(*status),
			SendError::InvalidPayload(_) => false,
		}
	}
}
