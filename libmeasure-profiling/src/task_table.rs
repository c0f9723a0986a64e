// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::ProfileError;
use core::hash::Hasher;
use libmeasure_alloc::{Allocator, ObjectId, ObjectManager};
use libmeasure_common::hash::JenkinsHasher;
use libmeasure_measurement::TaskId;

/// Where a suspended task continues: its innermost open node and the
/// number of frames open above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskContext {
    pub node: ObjectId,
    pub depth: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TaskEntry {
    pub task: TaskId,
    pub context: TaskContext,
    /// The task's own root node, detached from the location's tree until
    /// the task ends.
    pub root: ObjectId,
    next: Option<ObjectId>,
}

/// Open tasks of one location, bucketed by the hash of their id. Entries
/// live in arena pages and are recycled when a task ends.
pub struct TaskTable {
    buckets: Box<[Option<ObjectId>]>,
    entries: ObjectManager<TaskEntry>,
    fill_level: usize,
    max_active: usize,
}

impl TaskTable {
    pub fn new(allocator: &Allocator, buckets: u32) -> Result<Self, ProfileError> {
        let buckets = buckets.max(1) as usize;
        let mut table = Vec::new();
        table
            .try_reserve_exact(buckets)
            .map_err(|_| ProfileError::OutOfMemory)?;
        table.resize(buckets, None);
        Ok(Self {
            buckets: table.into_boxed_slice(),
            entries: ObjectManager::new(allocator)?,
            fill_level: 0,
            max_active: 0,
        })
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Tasks currently open.
    #[inline]
    pub fn fill_level(&self) -> usize {
        self.fill_level
    }

    /// Most tasks that were open at the same time.
    #[inline]
    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn reset_max_active(&mut self) {
        self.max_active = self.fill_level;
    }

    fn bucket(&self, task: TaskId) -> usize {
        let mut hasher = JenkinsHasher::default();
        hasher.write_u64(task.as_u64());
        hasher.finish32() as usize % self.buckets.len()
    }

    fn find_id(&self, task: TaskId) -> Option<ObjectId> {
        let mut next = self.buckets[self.bucket(task)];
        while let Some(id) = next {
            let entry = self.entries.get(id)?;
            if entry.task == task {
                return Some(id);
            }
            next = entry.next;
        }
        None
    }

    pub fn get(&self, task: TaskId) -> Option<&TaskEntry> {
        self.entries.get(self.find_id(task)?)
    }

    pub fn context_mut(&mut self, task: TaskId) -> Option<&mut TaskContext> {
        let id = self.find_id(task)?;
        self.entries.get_mut(id).map(|entry| &mut entry.context)
    }

    pub fn insert(&mut self, task: TaskId, root: ObjectId, depth: u32) -> Result<(), ProfileError> {
        let bucket = self.bucket(task);
        let id = self.entries.alloc(TaskEntry {
            task,
            context: TaskContext { node: root, depth },
            root,
            next: self.buckets[bucket],
        })?;
        self.buckets[bucket] = Some(id);
        self.fill_level += 1;
        self.max_active = self.max_active.max(self.fill_level);
        Ok(())
    }

    /// Unlinks the entry of `task` and recycles its storage.
    pub fn remove(&mut self, task: TaskId) -> Option<TaskEntry> {
        let bucket = self.bucket(task);
        let mut previous: Option<ObjectId> = None;
        let mut next = self.buckets[bucket];
        while let Some(id) = next {
            let entry = *self.entries.get(id)?;
            if entry.task == task {
                match previous {
                    Some(previous) => self.entries.get_mut(previous)?.next = entry.next,
                    None => self.buckets[bucket] = entry.next,
                }
                self.entries.free(id);
                self.fill_level -= 1;
                return Some(entry);
            }
            previous = Some(id);
            next = entry.next;
        }
        None
    }
}

impl core::fmt::Debug for TaskTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskTable")
            .field("buckets", &self.buckets.len())
            .field("fill_level", &self.fill_level)
            .field("max_active", &self.max_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn node_ids(allocator: &Allocator, n: usize) -> Vec<ObjectId> {
        // Any ObjectIds will do as roots; take them from a scratch pool.
        let mut scratch = ObjectManager::<u64>::new(allocator).unwrap();
        (0..n).map(|i| scratch.alloc(i as u64).unwrap()).collect()
    }

    #[test]
    fn zero_buckets_means_one() {
        let allocator = Allocator::new(1 << 16, 1024).unwrap();
        let mut table = TaskTable::new(&allocator, 0).unwrap();
        assert_eq!(table.bucket_count(), 1);
        let roots = node_ids(&allocator, 3);
        for (i, root) in roots.iter().enumerate() {
            table.insert(TaskId::new(1, i as u32 + 1), *root, 1).unwrap();
        }
        assert_eq!(table.get(TaskId::new(1, 2)).unwrap().root, roots[1]);
        assert_eq!(table.remove(TaskId::new(1, 2)).unwrap().root, roots[1]);
        assert!(table.get(TaskId::new(1, 2)).is_none());
        assert_eq!(table.get(TaskId::new(1, 3)).unwrap().root, roots[2]);
        assert_eq!(table.fill_level(), 2);
        assert_eq!(table.max_active(), 3);
    }

    #[test]
    fn entries_are_recycled() {
        let allocator = Allocator::new(1 << 16, 1024).unwrap();
        let mut table = TaskTable::new(&allocator, 4).unwrap();
        let root = node_ids(&allocator, 1)[0];
        for generation in 1..1000 {
            let task = TaskId::new(0, generation);
            table.insert(task, root, 1).unwrap();
            table.context_mut(task).unwrap().depth = 3;
            assert_eq!(table.get(task).unwrap().context.depth, 3);
            table.remove(task).unwrap();
        }
        assert_eq!(table.entries.live(), 0);
        assert_eq!(table.entries.pages_in_use(), 1);
        assert_eq!(table.max_active(), 1);
        table.reset_max_active();
        assert_eq!(table.max_active(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            ..ProptestConfig::default()
        })]

        #[test]
        fn behaves_like_a_map(ops in prop::collection::vec((any::<bool>(), 1u32..40), 1..200)) {
            let allocator = Allocator::new(1 << 18, 1024).unwrap();
            let root = node_ids(&allocator, 1)[0];
            let mut table = TaskTable::new(&allocator, 7).unwrap();
            let mut model = HashMap::new();
            for (insert, generation) in ops {
                let task = TaskId::new(generation % 3, generation);
                if insert && !model.contains_key(&task) {
                    table.insert(task, root, generation).unwrap();
                    model.insert(task, generation);
                } else if !insert {
                    let removed = table.remove(task).map(|entry| entry.context.depth);
                    prop_assert_eq!(removed, model.remove(&task));
                }
                prop_assert_eq!(table.fill_level(), model.len());
            }
            for (task, depth) in &model {
                prop_assert_eq!(table.get(*task).map(|entry| entry.context.depth), Some(*depth));
            }
        }
    }
}
