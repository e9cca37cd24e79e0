// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared, process-wide ambient concerns: the error taxonomy, an injectable
//! clock, a graceful-shutdown broadcast primitive, and `tracing` setup.
//!
//! Everything in this crate is usable from both the `supervisor-core` domain
//! crate and the binary; nothing here knows about tracks, cameras, or the
//! backend contract.

pub mod clock;
mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{prettify_failure, Error, ErrorKind, ResultExt};
