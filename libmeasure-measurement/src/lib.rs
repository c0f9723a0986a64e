// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide measurement state: one [`MeasurementContext`] owns the
//! arena, the definitions and the table of recording substrates, and every
//! event an adapter produces for a [`Location`] is fanned out from here.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod context;
mod error;
mod location;
pub mod logger;
mod substrates;

pub use config::*;
pub use context::*;
pub use error::*;
pub use location::*;
pub use substrates::*;

/// A raw timer value as delivered by the timer backend.
pub type Timestamp = u64;
