// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A fixed-capacity arena split into power-of-two pages.
//!
//! Every measurement subsystem draws its memory from one [`Allocator`]
//! created at start-up. Clients see the arena through a [`PageManager`],
//! which bump-allocates inside the pages it has checked out and can hand
//! out [`MovableMemory`] handles that stay meaningful after the pages are
//! copied somewhere else. [`ObjectManager`] is a fixed-size object pool on
//! top of directly acquired pages.
//!
//! Running out of arena is reported as [`AllocError`]; nothing in this
//! crate panics on exhaustion.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod allocator;
mod bitset;
mod object;
mod os;
mod page_manager;

pub use allocator::*;
pub use object::*;
pub use page_manager::*;

pub use allocator_api2::alloc::AllocError;

/// Every allocation is rounded up to, and aligned at, this many bytes.
pub const ALIGNMENT: usize = 8;

#[inline]
pub(crate) fn round_up(num: usize, pow2: usize) -> Option<usize> {
    debug_assert!(pow2.is_power_of_two());
    Some(num.checked_add(pow2 - 1)? & !(pow2 - 1))
}
