// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::SubstrateId;
use std::any::Any;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    CpuThread,
    GpuStream,
    /// Carries metric values only, e.g. an asynchronous sampling source.
    Metric,
}

/// Identifies a task across the whole process. The upper half is the id of
/// the location that created the task, the lower half a per-location
/// generation, so ids stay unique even when OS thread ids are reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The task every location runs when no explicit task is active.
    pub const IMPLICIT: TaskId = TaskId(0);

    pub const fn new(creator: u32, generation: u32) -> Self {
        Self(((creator as u64) << 32) | generation as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn creator(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn generation(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_implicit(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.creator(), self.generation())
    }
}

/// One independent source of events, owned by the thread that drives it.
///
/// Each registered substrate may park its own per-location state in the
/// slot named by its [`SubstrateId`].
pub struct Location {
    id: u32,
    kind: LocationKind,
    slots: Vec<Option<Box<dyn Any + Send>>>,
    next_generation: u32,
}

impl Location {
    pub(crate) fn new(id: u32, kind: LocationKind) -> Self {
        Self {
            id,
            kind,
            slots: Vec::new(),
            next_generation: 1,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    /// Mints a task id that no other location or earlier task uses.
    /// Generation 0 is never handed out, so no minted id is `IMPLICIT`.
    pub fn new_task_id(&mut self) -> TaskId {
        let generation = self.next_generation;
        self.next_generation = match generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        TaskId::new(self.id, generation)
    }

    #[inline]
    pub fn substrate_data<T: Any>(&self, id: SubstrateId) -> Option<&T> {
        self.slots.get(id.index())?.as_ref()?.downcast_ref()
    }

    #[inline]
    pub fn substrate_data_mut<T: Any>(&mut self, id: SubstrateId) -> Option<&mut T> {
        self.slots.get_mut(id.index())?.as_mut()?.downcast_mut()
    }

    pub fn set_substrate_data<T: Any + Send>(&mut self, id: SubstrateId, data: T) {
        if self.slots.len() <= id.index() {
            self.slots.resize_with(id.index() + 1, || None);
        }
        self.slots[id.index()] = Some(Box::new(data));
    }

    pub fn take_substrate_data<T: Any>(&mut self, id: SubstrateId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        match slot.take()?.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("slots", &self.slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_per_location() {
        let mut a = Location::new(1, LocationKind::CpuThread);
        let mut b = Location::new(2, LocationKind::CpuThread);
        let first = a.new_task_id();
        assert_eq!(first, TaskId::new(1, 1));
        assert_ne!(a.new_task_id(), first);
        assert_ne!(b.new_task_id(), first);
        assert!(!first.is_implicit());
        assert!(TaskId::IMPLICIT.is_implicit());
        assert_eq!(first.to_string(), "1:1");

        // Location 0 still never mints the implicit id.
        let mut zero = Location::new(0, LocationKind::CpuThread);
        zero.next_generation = u32::MAX;
        assert_eq!(zero.new_task_id().generation(), u32::MAX);
        assert_eq!(zero.new_task_id().generation(), 1);
    }

    #[test]
    fn substrate_slots() {
        let mut location = Location::new(0, LocationKind::GpuStream);
        let id = SubstrateId::new(2);
        assert_eq!(location.substrate_data::<u32>(id), None);
        location.set_substrate_data(id, 7u32);
        *location.substrate_data_mut::<u32>(id).unwrap() += 1;
        assert_eq!(location.substrate_data::<u32>(id), Some(&8));
        assert_eq!(location.substrate_data::<String>(id), None);
        assert_eq!(location.take_substrate_data::<String>(id), None);
        assert_eq!(location.take_substrate_data::<u32>(id), Some(8));
        assert_eq!(location.take_substrate_data::<u32>(id), None);
    }

    #[test]
    fn minted_ids_keep_their_creator() {
        bolero::check!()
            .with_type::<(u32, u8)>()
            .for_each(|(creator, count)| {
                let mut location = Location::new(*creator, LocationKind::CpuThread);
                let mut seen = Vec::new();
                for _ in 0..*count {
                    let task = location.new_task_id();
                    assert_eq!(task.creator(), *creator);
                    assert!(!task.is_implicit());
                    assert!(!seen.contains(&task));
                    seen.push(task);
                }
            });
    }
}
