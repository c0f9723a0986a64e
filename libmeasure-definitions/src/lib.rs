// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Definitions describe everything an event can refer to: strings,
//! regions, metrics, callpaths and so on. Each process keeps them in a
//! [`DefinitionManager`], deduplicated by structure, and at the end of the
//! run [`unify`] maps every process's local handles onto one global
//! numbering.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod collective;
mod error;
mod handle;
mod kinds;
mod manager;
mod table;
mod unify;

pub use error::*;
pub use handle::*;
pub use kinds::*;
pub use manager::*;
pub use unify::*;
