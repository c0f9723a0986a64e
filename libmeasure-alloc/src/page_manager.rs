// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{round_up, AllocError, Allocator, ALIGNMENT};
use core::ptr::{self, NonNull};
use hashbrown::HashMap;

/// A relocatable reference into memory owned by a [`PageManager`]: the id of
/// the page (run) the allocation starts in plus a byte offset. It never
/// stores an address, so it stays valid when the pages are copied into a
/// moved manager in another address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MovableMemory {
    page_id: u32,
    offset: u32,
}

impl MovableMemory {
    #[inline]
    pub fn page_id(&self) -> u32 {
        self.page_id
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Usage report for one page (run) owned by a manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: u32,
    /// Number of consecutive arena pages in this run.
    pub order: u32,
    /// Bytes in use, counted from the start of the run.
    pub usage: u32,
}

#[derive(Clone, Copy, Debug)]
struct Page {
    id: u32,
    order: u32,
    used: u32,
}

#[derive(Debug)]
enum Flavor {
    Live,
    /// Remote page id to local page id.
    Moved(HashMap<u32, u32>),
}

/// Client view of the arena. A manager owns the pages it has checked out
/// and bump-allocates inside the newest one. It is meant to be used from
/// one context at a time; only page checkout touches shared state.
#[derive(Debug)]
pub struct PageManager {
    allocator: Allocator,
    pages: Vec<Page>,
    index: HashMap<u32, usize>,
    flavor: Flavor,
    last_allocation: Option<MovableMemory>,
}

impl PageManager {
    pub(crate) fn new_live(allocator: Allocator) -> Self {
        Self::new(allocator, Flavor::Live)
    }

    pub(crate) fn new_moved(allocator: Allocator) -> Self {
        Self::new(allocator, Flavor::Moved(HashMap::new()))
    }

    fn new(allocator: Allocator, flavor: Flavor) -> Self {
        Self {
            allocator,
            pages: Vec::new(),
            index: HashMap::new(),
            flavor,
            last_allocation: None,
        }
    }

    #[inline]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        matches!(self.flavor, Flavor::Moved(_))
    }

    /// Allocates `size` bytes, rounded up to [`ALIGNMENT`].
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let (memory, size) = self.allocate(size)?;
        self.last_allocation = None;
        let start = self.resolve(memory).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(start, size))
    }

    /// Like [`alloc`](Self::alloc) but returns a handle. The allocation can
    /// be undone with [`rollback_alloc_movable`](Self::rollback_alloc_movable)
    /// as long as nothing else was allocated in between.
    pub fn alloc_movable(&mut self, size: usize) -> Result<MovableMemory, AllocError> {
        let (memory, _) = self.allocate(size)?;
        self.last_allocation = Some(memory);
        Ok(memory)
    }

    /// Undoes the latest [`alloc_movable`](Self::alloc_movable). Returns
    /// false, changing nothing, if `memory` is not the latest allocation.
    pub fn rollback_alloc_movable(&mut self, memory: MovableMemory) -> bool {
        if self.last_allocation != Some(memory) {
            return false;
        }
        self.last_allocation = None;
        let Some(page) = self.pages.last_mut() else {
            return false;
        };
        debug_assert_eq!(page.id, memory.page_id);
        page.used = memory.offset;
        if page.used == 0 {
            // The allocation opened this run; hand it back so the manager
            // looks exactly as before.
            let page = *page;
            self.pages.pop();
            self.index.remove(&page.id);
            self.allocator.put_pages(page.id, page.order);
        }
        true
    }

    /// Translates a handle into an address. Returns `None` if the handle
    /// does not point into memory this manager has handed out.
    pub fn get_address(&self, memory: MovableMemory) -> Option<NonNull<u8>> {
        let memory = match &self.flavor {
            Flavor::Live => memory,
            Flavor::Moved(remote_to_local) => MovableMemory {
                page_id: *remote_to_local.get(&memory.page_id)?,
                offset: memory.offset,
            },
        };
        self.resolve(memory)
    }

    fn resolve(&self, memory: MovableMemory) -> Option<NonNull<u8>> {
        let page = self.pages.get(*self.index.get(&memory.page_id)?)?;
        if memory.offset >= page.used {
            return None;
        }
        // SAFETY: offset < used <= order * page_size, inside the run.
        Some(unsafe {
            self.allocator
                .page_start(page.id)
                .add(memory.offset as usize)
        })
    }

    fn allocate(&mut self, size: usize) -> Result<(MovableMemory, usize), AllocError> {
        if self.is_moved() || size == 0 || size > self.allocator.total_memory() {
            return Err(AllocError);
        }
        let size = round_up(size, ALIGNMENT).ok_or(AllocError)?;
        let page_size = self.allocator.page_size();

        if let Some(page) = self.pages.last_mut() {
            let capacity = page.order as usize * page_size;
            if let Some(used) = bump(page.used, size, capacity) {
                let memory = MovableMemory {
                    page_id: page.id,
                    offset: page.used,
                };
                page.used = used;
                return Ok((memory, size));
            }
        }

        let order = self.allocator.order_for(size).ok_or(AllocError)?;
        let used = u32::try_from(size).map_err(|_| AllocError)?;
        let id = self.push_pages(order, used)?;
        Ok((
            MovableMemory {
                page_id: id,
                offset: 0,
            },
            size,
        ))
    }

    fn push_pages(&mut self, order: u32, used: u32) -> Result<u32, AllocError> {
        self.pages.try_reserve(1).map_err(|_| AllocError)?;
        self.index.try_reserve(1).map_err(|_| AllocError)?;
        let id = self.allocator.take_pages(order)?;
        self.index.insert(id, self.pages.len());
        self.pages.push(Page { id, order, used });
        Ok(id)
    }

    /// Copies one page (run) of another process's memory image into this
    /// moved manager, so handles naming `remote_page_id` resolve here.
    pub fn import_page(&mut self, remote_page_id: u32, bytes: &[u8]) -> Result<(), AllocError> {
        let mut destination = self.alloc_moved_page(remote_page_id, bytes.len())?;
        // SAFETY: the destination is a fresh run of at least bytes.len()
        // bytes owned by this manager.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), destination.as_mut().as_mut_ptr(), bytes.len())
        };
        Ok(())
    }

    /// Reserves room for a remote page and returns it for the caller to
    /// fill. Only valid on moved managers.
    pub fn alloc_moved_page(
        &mut self,
        remote_page_id: u32,
        usage: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let Flavor::Moved(remote_to_local) = &self.flavor else {
            return Err(AllocError);
        };
        if usage == 0 || remote_to_local.contains_key(&remote_page_id) {
            return Err(AllocError);
        }
        let order = self.allocator.order_for(usage).ok_or(AllocError)?;
        let used = u32::try_from(usage).map_err(|_| AllocError)?;
        let local = self.push_pages(order, used)?;
        if let Flavor::Moved(remote_to_local) = &mut self.flavor {
            remote_to_local.insert(remote_page_id, local);
        }
        Ok(NonNull::slice_from_raw_parts(
            self.allocator.page_start(local),
            usage,
        ))
    }

    pub fn number_of_used_pages(&self) -> usize {
        self.pages.len()
    }

    /// Usage of every run, in checkout order.
    pub fn page_infos(&self) -> impl Iterator<Item = PageInfo> + '_ {
        self.pages.iter().map(|page| PageInfo {
            page_id: page.id,
            order: page.order,
            usage: page.used,
        })
    }

    /// The used bytes of one run, for shipping a memory image.
    pub fn page_memory(&self, page_id: u32) -> Option<&[u8]> {
        let page = self.pages.get(*self.index.get(&page_id)?)?;
        let start = self.allocator.page_start(page.id);
        // SAFETY: the first `used` bytes of the run were handed out by this
        // manager and stay mapped as long as it lives.
        Some(unsafe { core::slice::from_raw_parts(start.as_ptr(), page.used as usize) })
    }

    /// Bytes still available in the current page without taking a new one.
    pub fn remaining_in_current_page(&self) -> usize {
        self.pages.last().map_or(0, |page| {
            page.order as usize * self.allocator.page_size() - page.used as usize
        })
    }

    /// Returns every page to the arena. The manager stays usable.
    pub fn reset(&mut self) {
        for page in self.pages.drain(..) {
            self.allocator.put_pages(page.id, page.order);
        }
        self.index.clear();
        self.last_allocation = None;
        if let Flavor::Moved(remote_to_local) = &mut self.flavor {
            remote_to_local.clear();
        }
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The fill level of a run after carving `size` more bytes from it, if
/// they fit within `capacity`.
#[inline]
fn bump(used: u32, size: usize, capacity: usize) -> Option<u32> {
    let used = used.checked_add(u32::try_from(size).ok()?)?;
    (used as usize <= capacity).then_some(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[track_caller]
    fn fill(manager: &PageManager, memory: MovableMemory, len: usize, byte: u8) {
        let start = manager.get_address(memory).unwrap();
        // SAFETY: the allocation is at least len bytes and exclusively ours.
        unsafe { ptr::write_bytes(start.as_ptr(), byte, len) };
    }

    #[test]
    fn bump_stays_within_the_run() {
        assert_eq!(bump(8, 16, 64), Some(24));
        assert_eq!(bump(48, 16, 64), Some(64));
        assert_eq!(bump(56, 16, 64), None);
        // Runs of 4 GiB and more must not wrap the fill level.
        let huge = 1usize << 33;
        assert_eq!(bump(8, (1 << 32) + 8, huge), None);
        assert_eq!(bump(u32::MAX - 8, 16, huge), None);
        assert_eq!(bump(8, 1 << 20, huge), Some(8 + (1 << 20)));
    }

    #[test]
    fn small_arena_scenario() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        let mut handles = Vec::new();
        for _ in 0..20 {
            handles.push(manager.alloc_movable(24).unwrap());
        }
        handles.dedup();
        assert_eq!(handles.len(), 20);

        // Two 24-byte objects fit per 64-byte page.
        loop {
            match manager.alloc_movable(24) {
                Ok(handle) => handles.push(handle),
                Err(AllocError) => break,
            }
        }
        assert_eq!(handles.len(), 32);
        assert_eq!(allocator.free_page_count(), 0);
        manager.alloc(24).unwrap_err();
        // The 16-byte tails of each page are still usable.
        manager.alloc(16).unwrap();

        drop(manager);
        assert_eq!(allocator.free_page_count(), 16);
    }

    #[test]
    fn rejects_zero_and_oversized() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        manager.alloc(0).unwrap_err();
        manager.alloc_movable(1025).unwrap_err();
        assert_eq!(manager.number_of_used_pages(), 0);
    }

    #[test]
    fn large_allocations_span_pages() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        let small = manager.alloc_movable(8).unwrap();
        let large = manager.alloc_movable(200).unwrap();
        assert_ne!(small.page_id(), large.page_id());
        assert_eq!(large.offset(), 0);
        assert_eq!(allocator.free_page_count(), 16 - 1 - 4);
        fill(&manager, large, 200, 0xEE);

        // The remainder of the 4-page run serves the next allocation.
        let next = manager.alloc_movable(48).unwrap();
        assert_eq!(next.page_id(), large.page_id());
        assert_eq!(next.offset(), 200);
    }

    #[test]
    fn rollback_restores_state() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        manager.alloc_movable(40).unwrap();
        let before = (manager.remaining_in_current_page(), allocator.free_page_count());

        let same_page = manager.alloc_movable(16).unwrap();
        assert!(manager.rollback_alloc_movable(same_page));
        assert_eq!(
            (manager.remaining_in_current_page(), allocator.free_page_count()),
            before
        );

        let new_page = manager.alloc_movable(32).unwrap();
        assert_eq!(new_page.offset(), 0);
        assert!(manager.rollback_alloc_movable(new_page));
        assert_eq!(
            (manager.remaining_in_current_page(), allocator.free_page_count()),
            before
        );
        assert!(manager.get_address(new_page).is_none());
    }

    #[test]
    fn rollback_only_undoes_the_latest() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        let first = manager.alloc_movable(8).unwrap();
        let second = manager.alloc_movable(8).unwrap();
        assert!(!manager.rollback_alloc_movable(first));
        manager.alloc(8).unwrap();
        assert!(!manager.rollback_alloc_movable(second));
        assert!(manager.get_address(second).is_some());
    }

    #[test]
    fn foreign_handles_do_not_resolve() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut a = allocator.create_page_manager();
        let mut b = allocator.create_page_manager();
        let in_a = a.alloc_movable(8).unwrap();
        b.alloc_movable(8).unwrap();
        assert!(b.get_address(in_a).is_none());
        assert!(a.get_address(in_a).is_some());
    }

    #[test]
    fn moved_manager_resolves_remote_handles() {
        let remote_arena = Allocator::new(4096, 256).unwrap();
        let mut remote = remote_arena.create_page_manager();
        // Burn a few pages so remote and local ids differ.
        let _spacer = remote_arena.acquire_page().unwrap();
        let _spacer2 = remote_arena.acquire_page().unwrap();
        let mut handles = Vec::new();
        for i in 0..40u8 {
            let handle = remote.alloc_movable(16).unwrap();
            fill(&remote, handle, 16, i);
            handles.push((handle, i));
        }

        let local_arena = Allocator::new(4096, 256).unwrap();
        let mut moved = local_arena.create_moved_page_manager();
        moved.alloc(8).unwrap_err();
        let infos: Vec<_> = remote.page_infos().collect();
        assert_eq!(infos.len(), remote.number_of_used_pages());
        for info in &infos {
            let bytes = remote.page_memory(info.page_id).unwrap();
            assert_eq!(bytes.len(), info.usage as usize);
            moved.import_page(info.page_id, bytes).unwrap();
        }
        moved.import_page(infos[0].page_id, &[0; 8]).unwrap_err();

        for (handle, value) in handles {
            let address = moved.get_address(handle).unwrap();
            // SAFETY: 16 bytes were imported at this handle.
            let bytes = unsafe { core::slice::from_raw_parts(address.as_ptr(), 16) };
            assert!(bytes.iter().all(|b| *b == value));
        }
    }

    #[test]
    fn reset_returns_pages() {
        let allocator = Allocator::new(1024, 64).unwrap();
        let mut manager = allocator.create_page_manager();
        for _ in 0..10 {
            manager.alloc(40).unwrap();
        }
        assert_eq!(allocator.free_page_count(), 6);
        manager.reset();
        assert_eq!(allocator.free_page_count(), 16);
        manager.alloc(40).unwrap();
        assert_eq!(manager.number_of_used_pages(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            ..ProptestConfig::default()
        })]

        #[test]
        fn allocations_never_overlap(sizes in proptest::collection::vec(1usize..300, 1..64)) {
            let allocator = Allocator::new(16 * 1024, 128).unwrap();
            let mut manager = allocator.create_page_manager();
            let mut regions: Vec<(usize, usize, u8)> = Vec::new();
            for (i, size) in sizes.into_iter().enumerate() {
                let Ok(handle) = manager.alloc_movable(size) else { break };
                let start = manager.get_address(handle).unwrap().as_ptr() as usize;
                prop_assert_eq!(start % ALIGNMENT, 0);
                for (other, other_len, _) in &regions {
                    prop_assert!(start + size <= *other || other + other_len <= start);
                }
                let tag = i as u8;
                fill(&manager, handle, size, tag);
                regions.push((start, size, tag));
            }
            for (start, len, tag) in regions {
                // SAFETY: every region is still owned by the manager.
                let bytes = unsafe { core::slice::from_raw_parts(start as *const u8, len) };
                prop_assert!(bytes.iter().all(|b| *b == tag));
            }
        }
    }
}
