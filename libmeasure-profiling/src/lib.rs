// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The profiling substrate. Every location builds its own calling-context
//! tree on line: nodes are found or created on enter, metrics are
//! accumulated on exit, and interleaved tasks are kept apart by saving and
//! restoring a small [`TaskContext`] on every switch.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod callpath;
mod config;
mod error;
mod location;
mod metric;
mod node;
mod profile;
mod task_table;
mod tasking;

pub use callpath::*;
pub use config::*;
pub use error::*;
pub use location::*;
pub use metric::*;
pub use node::*;
pub use profile::*;
pub use task_table::*;
