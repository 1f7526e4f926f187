// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for Loom event delivery.
//!
//! This crate holds the data model shared by the delivery pipeline and its
//! callers: the [`Event`] wire representation, the [`Identify`] and
//! [`Revenue`] builders, and the structured bodies the collection endpoint
//! returns. It performs no I/O.

pub mod constants;
pub mod event;
pub mod identify;
pub mod response;
pub mod revenue;

pub use event::{
	Event, EventCallback, EventDecodeError, EventKind, IngestionMetadata, Plan, Properties,
};
pub use identify::{Identify, IdentifyOperation};
pub use response::BadRequestBody;
pub use revenue::Revenue;
