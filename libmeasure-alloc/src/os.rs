// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backing store for the arena: one anonymous, zeroed, read-write mapping
//! obtained straight from the OS so that the arena never competes with the
//! instrumented program's heap.

use crate::AllocError;
use core::ptr::NonNull;

/// Owns a region of virtual memory. The mapping is released on drop.
#[derive(Debug)]
pub(crate) struct VirtualMemory {
    start: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value. Concurrent access
// to its bytes is coordinated by the page bookkeeping in the allocator.
unsafe impl Send for VirtualMemory {}
// SAFETY: see above, shared references only ever expose raw pointers.
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Maps at least `len` bytes, padded to whole OS pages.
    pub(crate) fn map(len: usize) -> Result<Self, AllocError> {
        if len == 0 {
            return Err(AllocError);
        }
        let os_page = page_size()?;
        let len = crate::round_up(len, os_page).ok_or(AllocError)?;
        let start = sys::map(len)?;
        Ok(Self { start, len })
    }

    #[inline]
    pub(crate) fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[allow(unused)]
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        // SAFETY: start/len describe exactly the mapping created in `map`.
        unsafe { sys::unmap(self.start, self.len) }
    }
}

macro_rules! validate_page_size {
    ($x:expr) => {
        // On some platforms this may be unsigned or signed.
        #[allow(unused_comparisons)]
        if $x < 0 {
            Err(AllocError)
        } else {
            let size = $x as usize;
            if size.is_power_of_two() {
                Ok(size)
            } else {
                Err(AllocError)
            }
        }
    };
}

pub(crate) fn page_size() -> Result<usize, AllocError> {
    sys::page_size()
}

#[cfg(unix)]
mod sys {
    use crate::AllocError;
    use core::ptr::{self, NonNull};

    pub fn page_size() -> Result<usize, AllocError> {
        // SAFETY: calling sysconf with correct arguments.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        validate_page_size!(result)
    }

    pub fn map(len: usize) -> Result<NonNull<u8>, AllocError> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        // SAFETY: these args create a new private mapping, akin to malloc.
        let result = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if result == libc::MAP_FAILED {
            return Err(AllocError);
        }
        NonNull::new(result.cast::<u8>()).ok_or(AllocError)
    }

    /// # Safety
    /// `start` and `len` must come from a previous successful [`map`].
    pub unsafe fn unmap(start: NonNull<u8>, len: usize) {
        _ = libc::munmap(start.as_ptr().cast(), len);
    }
}

#[cfg(windows)]
mod sys {
    use crate::AllocError;
    use core::{mem, ptr::NonNull};
    use windows_sys::Win32::System::Memory;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> Result<usize, AllocError> {
        let mut system_info = mem::MaybeUninit::<SYSTEM_INFO>::uninit();
        // SAFETY: calling C function with correct uninit repr.
        unsafe { GetSystemInfo(system_info.as_mut_ptr()) };
        // SAFETY: GetSystemInfo is not documented to fail.
        let system_info = unsafe { system_info.assume_init() };
        validate_page_size!(system_info.dwPageSize)
    }

    pub fn map(len: usize) -> Result<NonNull<u8>, AllocError> {
        let alloc_type = Memory::MEM_COMMIT | Memory::MEM_RESERVE;
        // SAFETY: these args create a new allocation, akin to malloc.
        let result = unsafe {
            Memory::VirtualAlloc(core::ptr::null(), len, alloc_type, Memory::PAGE_READWRITE)
        };
        NonNull::new(result.cast::<u8>()).ok_or(AllocError)
    }

    /// # Safety
    /// `start` must come from a previous successful [`map`].
    pub unsafe fn unmap(start: NonNull<u8>, _len: usize) {
        _ = Memory::VirtualFree(start.as_ptr().cast(), 0, Memory::MEM_RELEASE);
    }
}
