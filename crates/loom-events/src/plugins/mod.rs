// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Built-in plugins installed by every client.

mod context;
mod destination;

pub(crate) use context::ContextPlugin;
pub(crate) use destination::DestinationPlugin;
