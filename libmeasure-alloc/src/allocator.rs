// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::bitset::PageBitset;
use crate::os::VirtualMemory;
use crate::{AllocError, PageManager, ALIGNMENT};
use core::fmt;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::sync::Arc;

/// The process-wide arena. Cloning is cheap and yields another handle to the
/// same pages; the memory is returned to the OS when the last handle (and
/// every page manager created from it) is gone.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<Shared>,
}

struct Shared {
    memory: VirtualMemory,
    page_shift: u32,
    page_count: u32,
    free_pages: Mutex<PageBitset>,
}

impl Allocator {
    /// Creates an arena of `total_memory` bytes split into pages of
    /// `page_size` bytes.
    ///
    /// The page size is rounded up to a power of two (and to at least
    /// [`ALIGNMENT`]); it must not exceed `total_memory`. The total is then
    /// rounded down to a whole number of pages.
    pub fn new(total_memory: usize, page_size: usize) -> Result<Self, AllocError> {
        if page_size == 0 || total_memory == 0 {
            return Err(AllocError);
        }
        let page_size = page_size
            .checked_next_power_of_two()
            .ok_or(AllocError)?
            .max(ALIGNMENT);
        if page_size > total_memory {
            return Err(AllocError);
        }
        let page_count = u32::try_from(total_memory / page_size).map_err(|_| AllocError)?;
        let memory = VirtualMemory::map(page_count as usize * page_size)?;

        Ok(Self {
            shared: Arc::new(Shared {
                memory,
                page_shift: page_size.trailing_zeros(),
                page_count,
                free_pages: Mutex::new(PageBitset::new(page_count)),
            }),
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.shared.page_shift
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.shared.page_count
    }

    /// Usable bytes after rounding.
    #[inline]
    pub fn total_memory(&self) -> usize {
        self.page_count() as usize * self.page_size()
    }

    pub fn free_page_count(&self) -> u32 {
        self.shared.free_pages.lock().free_count()
    }

    /// A manager that allocates fresh memory from this arena.
    pub fn create_page_manager(&self) -> PageManager {
        PageManager::new_live(self.clone())
    }

    /// A manager that only holds pages copied from another address space and
    /// resolves handles that were created there.
    pub fn create_moved_page_manager(&self) -> PageManager {
        PageManager::new_moved(self.clone())
    }

    /// Checks out a single page for exclusive, manual use. The page goes
    /// back to the free list when the returned value is dropped.
    pub fn acquire_page(&self) -> Result<AcquiredPage, AllocError> {
        let id = self.take_pages(1)?;
        Ok(AcquiredPage {
            allocator: self.clone(),
            id,
        })
    }

    /// Explicit spelling of dropping the page.
    pub fn release_page(&self, page: AcquiredPage) {
        debug_assert!(Arc::ptr_eq(&self.shared, &page.allocator.shared));
        drop(page)
    }

    /// Number of pages needed for `size` bytes.
    #[inline]
    pub(crate) fn order_for(&self, size: usize) -> Option<u32> {
        let pages = size.div_ceil(self.page_size()).max(1);
        u32::try_from(pages).ok()
    }

    pub(crate) fn take_pages(&self, order: u32) -> Result<u32, AllocError> {
        self.shared
            .free_pages
            .lock()
            .take_range(order)
            .ok_or(AllocError)
    }

    pub(crate) fn put_pages(&self, id: u32, order: u32) {
        self.shared.free_pages.lock().release_range(id, order)
    }

    /// Start address of page `id`.
    #[inline]
    pub(crate) fn page_start(&self, id: u32) -> NonNull<u8> {
        debug_assert!(id < self.shared.page_count);
        let offset = (id as usize) << self.shared.page_shift;
        // SAFETY: the id came from the bitset so it is below page_count, and
        // page_count pages fit in the mapping.
        unsafe { self.shared.memory.start().add(offset) }
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("page_size", &self.page_size())
            .field("page_count", &self.page_count())
            .field("free_pages", &self.free_page_count())
            .finish()
    }
}

/// One page taken out of the arena for manual management.
#[derive(Debug)]
pub struct AcquiredPage {
    allocator: Allocator,
    id: u32,
}

impl AcquiredPage {
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.allocator.page_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The whole page. Nothing else in the process aliases it while this
    /// value is alive.
    #[inline]
    pub fn as_non_null(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.allocator.page_start(self.id), self.len())
    }
}

impl Drop for AcquiredPage {
    fn drop(&mut self) {
        self.allocator.put_pages(self.id, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_normalized() {
        let allocator = Allocator::new(1000, 60).unwrap();
        assert_eq!(allocator.page_size(), 64);
        assert_eq!(allocator.page_count(), 15);
        assert_eq!(allocator.total_memory(), 960);

        let allocator = Allocator::new(1024, 1).unwrap();
        assert_eq!(allocator.page_size(), ALIGNMENT);
        assert_eq!(allocator.page_count(), 128);
    }

    #[test]
    fn invalid_geometry() {
        Allocator::new(0, 64).unwrap_err();
        Allocator::new(1024, 0).unwrap_err();
        Allocator::new(100, 128).unwrap_err();
    }

    #[test]
    fn acquire_and_release() {
        let allocator = Allocator::new(256, 64).unwrap();
        let pages: Vec<_> = (0..4).map(|_| allocator.acquire_page().unwrap()).collect();
        assert_eq!(allocator.free_page_count(), 0);
        allocator.acquire_page().unwrap_err();

        let mut ids: Vec<_> = pages.iter().map(AcquiredPage::id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        let starts: Vec<_> = pages
            .iter()
            .map(|p| p.as_non_null().cast::<u8>().as_ptr() as usize)
            .collect();
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], 64);
        }

        let mut pages = pages;
        let page = pages.pop().unwrap();
        allocator.release_page(page);
        assert_eq!(allocator.free_page_count(), 1);
        drop(pages);
        assert_eq!(allocator.free_page_count(), 4);
    }

    #[test]
    fn pages_are_writable() {
        let allocator = Allocator::new(4096, 1024).unwrap();
        let page = allocator.acquire_page().unwrap();
        // SAFETY: the page is exclusively ours.
        let bytes = unsafe { &mut *page.as_non_null().as_ptr() };
        bytes.fill(0x5A);
        assert!(bytes.iter().all(|b| *b == 0x5A));
    }
}
