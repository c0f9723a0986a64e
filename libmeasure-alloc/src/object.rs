// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A pool of equally sized objects carved out of whole arena pages.
//!
//! Objects are addressed by a dense [`ObjectId`] rather than by pointer;
//! freed ids go onto a free list and are handed out again before the pool
//! grows. Each object is `width` consecutive values of `T`, so a pool can
//! also hold fixed-length arrays whose length is only known at runtime.

use crate::{AcquiredPage, AllocError, Allocator, ALIGNMENT};
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

pub struct ObjectManager<T: Copy> {
    allocator: Allocator,
    pages: Vec<AcquiredPage>,
    width: usize,
    per_page: u32,
    bumped: u32,
    free_list: Vec<ObjectId>,
    _marker: PhantomData<T>,
}

impl<T: Copy> ObjectManager<T> {
    pub fn new(allocator: &Allocator) -> Result<Self, AllocError> {
        Self::with_width(allocator, 1)
    }

    pub fn with_width(allocator: &Allocator, width: usize) -> Result<Self, AllocError> {
        if width == 0 || mem::size_of::<T>() == 0 || mem::align_of::<T>() > ALIGNMENT {
            return Err(AllocError);
        }
        let object_size = mem::size_of::<T>().checked_mul(width).ok_or(AllocError)?;
        let per_page = u32::try_from(allocator.page_size() / object_size).map_err(|_| AllocError)?;
        if per_page == 0 {
            return Err(AllocError);
        }
        Ok(Self {
            allocator: allocator.clone(),
            pages: Vec::new(),
            width,
            per_page,
            bumped: 0,
            free_list: Vec::new(),
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Objects currently handed out.
    #[inline]
    pub fn live(&self) -> usize {
        self.bumped as usize - self.free_list.len()
    }

    #[inline]
    pub fn pages_in_use(&self) -> usize {
        self.pages.len()
    }

    /// Takes an object and sets every element to `value`.
    pub fn alloc(&mut self, value: T) -> Result<ObjectId, AllocError> {
        self.free_list.try_reserve(1).map_err(|_| AllocError)?;
        let id = match self.free_list.pop() {
            Some(id) => id,
            None => {
                let index = self.bumped;
                if index / self.per_page == self.pages.len() as u32 {
                    self.pages.try_reserve(1).map_err(|_| AllocError)?;
                    self.pages.push(self.allocator.acquire_page()?);
                }
                self.bumped = index.checked_add(1).ok_or(AllocError)?;
                ObjectId(index)
            }
        };
        let start = self.slot(id).ok_or(AllocError)?;
        for i in 0..self.width {
            // SAFETY: the slot holds `width` elements inside a page we own,
            // aligned for T because object offsets are multiples of
            // size_of::<T>() and pages are aligned to at least ALIGNMENT.
            unsafe { start.add(i).write(value) };
        }
        Ok(id)
    }

    /// Returns an object to the free list. The id must not be used again.
    pub fn free(&mut self, id: ObjectId) {
        debug_assert!(id.0 < self.bumped);
        debug_assert!(!self.free_list.contains(&id));
        if id.0 < self.bumped {
            self.free_list.push(id);
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        self.get_slice(id)?.first()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        self.get_slice_mut(id)?.first_mut()
    }

    pub fn get_slice(&self, id: ObjectId) -> Option<&[T]> {
        let start = self.slot(id)?;
        // SAFETY: ids below `bumped` were initialized by `alloc`, and the
        // borrow of self keeps the page alive and unaliased by &mut.
        Some(unsafe { core::slice::from_raw_parts(start.as_ptr(), self.width) })
    }

    pub fn get_slice_mut(&mut self, id: ObjectId) -> Option<&mut [T]> {
        let start = self.slot(id)?;
        // SAFETY: as in get_slice, and &mut self guarantees uniqueness.
        Some(unsafe { core::slice::from_raw_parts_mut(start.as_ptr(), self.width) })
    }

    fn slot(&self, id: ObjectId) -> Option<NonNull<T>> {
        if id.0 >= self.bumped {
            return None;
        }
        let page = self.pages.get((id.0 / self.per_page) as usize)?;
        let offset = (id.0 % self.per_page) as usize * self.width;
        // SAFETY: offset + width <= per_page * width elements, which fit
        // in one page by construction.
        Some(unsafe { page.as_non_null().cast::<T>().add(offset) })
    }
}

impl<T: Copy> core::fmt::Debug for ObjectManager<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectManager")
            .field("width", &self.width)
            .field("per_page", &self.per_page)
            .field("live", &self.live())
            .field("pages", &self.pages.len())
            .finish()
    }
}
