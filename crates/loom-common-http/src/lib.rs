// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for Loom.
//!
//! This crate provides:
//! - A pre-configured HTTP client with consistent User-Agent header
//! - Classification of transient failures and exponential backoff delays

mod client;
mod retry;

pub use client::{builder, user_agent};
pub use retry::{is_retryable_status, Backoff, RetryableError};
