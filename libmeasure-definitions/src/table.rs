// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind storage: records live in arena pages, addressed through
//! movable handles, and a hash index over sequence numbers finds
//! structurally equal records.

use crate::{
    CallpathDef, CommunicatorDef, Definable, GroupDef, Handle, MetricDef, ParameterDef, RegionDef,
    SourceFileDef, StringDef,
};
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use hashbrown::HashTable;
use libmeasure_alloc::{AllocError, MovableMemory, PageManager, ALIGNMENT};
use libmeasure_common::hash::JenkinsHasher;

/// What is written into the arena for every definition: a header, the
/// payload, then `tail_len` bytes of variable-length data.
#[repr(C)]
#[derive(Clone, Copy)]
struct Record<T> {
    unified: Option<u32>,
    hash_value: u32,
    sequence_number: u32,
    tail_len: u32,
    payload: T,
}

const fn header_fits<T>() -> bool {
    mem::align_of::<Record<T>>() <= ALIGNMENT
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    memory: MovableMemory,
    hash: u32,
}

#[doc(hidden)]
pub struct KindTable<T> {
    entries: Vec<Entry>,
    index: HashTable<u32>,
    pub(crate) disabled: bool,
    pub(crate) mapping: Option<Vec<u32>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Default for KindTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashTable::new(),
            disabled: false,
            mapping: None,
            _kind: PhantomData,
        }
    }
}

#[doc(hidden)]
#[derive(Default)]
pub struct Tables {
    pub(crate) strings: KindTable<StringDef>,
    pub(crate) source_files: KindTable<SourceFileDef>,
    pub(crate) regions: KindTable<RegionDef>,
    pub(crate) parameters: KindTable<ParameterDef>,
    pub(crate) metrics: KindTable<MetricDef>,
    pub(crate) groups: KindTable<GroupDef>,
    pub(crate) communicators: KindTable<CommunicatorDef>,
    pub(crate) callpaths: KindTable<CallpathDef>,
}

impl Tables {
    /// Number of definitions per kind, indexed like
    /// [`DefinitionKind::UNIFY_ORDER`](crate::DefinitionKind::UNIFY_ORDER).
    pub(crate) fn lens(&self) -> [usize; crate::DefinitionKind::COUNT] {
        [
            self.strings.len(),
            self.source_files.len(),
            self.regions.len(),
            self.parameters.len(),
            self.metrics.len(),
            self.groups.len(),
            self.communicators.len(),
            self.callpaths.len(),
        ]
    }
}

fn structural_hash<T: Hash>(payload: &T, tail: &[u8]) -> u32 {
    let mut hasher = JenkinsHasher::default();
    payload.hash(&mut hasher);
    hasher.write(tail);
    hasher.finish32()
}

/// The header and tail of the record at `memory`.
///
/// Only called with memory that `KindTable<T>::insert` filled.
fn read_record<T: Definable>(
    pages: &PageManager,
    memory: MovableMemory,
) -> Option<(Record<T>, &[u8])> {
    let start = pages.get_address(memory)?;
    // SAFETY: insert wrote an aligned Record<T> followed by tail_len bytes
    // at this address, and the page stays mapped while `pages` is borrowed.
    unsafe {
        let record = start.cast::<Record<T>>().as_ptr().read();
        let tail = core::slice::from_raw_parts(
            start.as_ptr().add(mem::size_of::<Record<T>>()),
            record.tail_len as usize,
        );
        Some((record, tail))
    }
}

impl<T: Definable> KindTable<T> {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn contains(&self, handle: Handle<T>) -> bool {
        (handle.id() as usize) < self.entries.len()
    }

    /// Adds the definition unless an equal one exists, in which case the
    /// speculative record is rolled back and the existing handle returned.
    pub(crate) fn insert(
        &mut self,
        pages: &mut PageManager,
        payload: T,
        tail: &[u8],
    ) -> Result<Handle<T>, AllocError> {
        if !header_fits::<T>() {
            return Err(AllocError);
        }
        let sequence_number = u32::try_from(self.entries.len()).map_err(|_| AllocError)?;
        let tail_len = u32::try_from(tail.len()).map_err(|_| AllocError)?;
        let hash_value = structural_hash(&payload, tail);

        let memory = pages.alloc_movable(mem::size_of::<Record<T>>() + tail.len())?;
        let start = pages.get_address(memory).ok_or(AllocError)?;
        let record = Record {
            unified: None,
            hash_value,
            sequence_number,
            tail_len,
            payload,
        };
        // SAFETY: the allocation is ALIGNMENT-aligned (enough for Record<T>
        // per header_fits) and large enough for the record plus its tail.
        unsafe {
            start.cast::<Record<T>>().as_ptr().write(record);
            ptr::copy_nonoverlapping(
                tail.as_ptr(),
                start.as_ptr().add(mem::size_of::<Record<T>>()),
                tail.len(),
            );
        }

        let Self { entries, index, .. } = self;
        let existing = {
            let pages: &PageManager = pages;
            index
                .find(u64::from(hash_value), |&seq| {
                    let Some(entry) = entries.get(seq as usize) else {
                        return false;
                    };
                    entry.hash == hash_value
                        && read_record::<T>(pages, entry.memory).is_some_and(
                            |(other, other_tail)| other.payload == payload && other_tail == tail,
                        )
                })
                .copied()
        };
        if let Some(seq) = existing {
            pages.rollback_alloc_movable(memory);
            return Ok(Handle::new(seq));
        }

        let commit = entries
            .try_reserve(1)
            .map_err(|_| AllocError)
            .and_then(|()| {
                index
                    .try_reserve(1, |&seq| rehash(entries, seq))
                    .map_err(|_| AllocError)
            });
        if let Err(err) = commit {
            pages.rollback_alloc_movable(memory);
            return Err(err);
        }
        entries.push(Entry {
            memory,
            hash: hash_value,
        });
        index.insert_unique(u64::from(hash_value), sequence_number, |&seq| {
            rehash(entries, seq)
        });
        Ok(Handle::new(sequence_number))
    }

    pub(crate) fn payload(&self, pages: &PageManager, handle: Handle<T>) -> Option<T> {
        let entry = self.entries.get(handle.id() as usize)?;
        read_record::<T>(pages, entry.memory).map(|(record, _)| record.payload)
    }

    /// Payload and tail, borrowed from the arena.
    pub(crate) fn record<'a>(
        &self,
        pages: &'a PageManager,
        handle: Handle<T>,
    ) -> Option<(T, &'a [u8])> {
        let entry = self.entries.get(handle.id() as usize)?;
        read_record::<T>(pages, entry.memory).map(|(record, tail)| (record.payload, tail))
    }

    pub(crate) fn unified(&self, pages: &PageManager, handle: Handle<T>) -> Option<Handle<T>> {
        let entry = self.entries.get(handle.id() as usize)?;
        let (record, _) = read_record::<T>(pages, entry.memory)?;
        record.unified.map(Handle::new)
    }

    /// Records the global sequence number of every definition. `mapping`
    /// must have one entry per definition.
    pub(crate) fn set_unified(&mut self, pages: &PageManager, mapping: Vec<u32>) -> bool {
        if mapping.len() != self.entries.len() {
            return false;
        }
        for (entry, global) in self.entries.iter().zip(&mapping) {
            let Some(start) = pages.get_address(entry.memory) else {
                return false;
            };
            let record = start.cast::<Record<T>>().as_ptr();
            // SAFETY: the record was written by insert; only the `unified`
            // field is touched, and the caller holds the manager lock.
            unsafe { ptr::addr_of_mut!((*record).unified).write(Some(*global)) };
        }
        self.mapping = Some(mapping);
        true
    }
}

#[inline]
fn rehash(entries: &[Entry], seq: u32) -> u64 {
    entries
        .get(seq as usize)
        .map_or(0, |entry| u64::from(entry.hash))
}
