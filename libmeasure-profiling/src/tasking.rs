// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Explicit tasks. Each task grows its own tree under a detached task root.
//! While a task runs, the implicit task's node gets a task root child for
//! the task's region, so time spent in tasks shows up where they ran. When
//! a task ends its tree is merged under the location's `Tasks` node.

use crate::*;
use libmeasure_definitions::{Handle, RegionDef};
use libmeasure_measurement::TaskId;

impl ProfileLocation {
    pub fn task_begin(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        task: TaskId,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        self.check_metrics(metrics)?;
        if self.tasks.get(task).is_some() {
            return Err(ProfileError::DuplicateTask {
                location: self.location,
                task,
            });
        }
        let root = self
            .tree
            .new_node(NodeKind::TaskRoot(region), Some(self.root), timestamp)?;
        self.tree.start_visit(root, timestamp, metrics)?;
        if let Err(err) = self.tasks.insert(task, root, 1) {
            self.tree.free_node(root)?;
            return Err(err);
        }
        self.task_switch(timestamp, task, metrics)
    }

    /// Suspends the running task and resumes `target`.
    pub fn task_switch(
        &mut self,
        timestamp: u64,
        target: TaskId,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        self.check_metrics(metrics)?;
        if target == self.current_task {
            return Ok(());
        }
        let location = self.location;
        let target_root = if target.is_implicit() {
            None
        } else {
            let entry = self.tasks.get(target);
            Some(entry.ok_or_else(|| unknown_task(location, target))?.root)
        };

        let saved = TaskContext {
            node: self.current,
            depth: self.depth,
        };
        if self.current_task.is_implicit() {
            self.implicit = saved;
        } else {
            let current_task = self.current_task;
            *self
                .tasks
                .context_mut(current_task)
                .ok_or_else(|| unknown_task(location, current_task))? = saved;
            self.tree.pause_chain(self.current, timestamp, metrics, false)?;
            self.leave_task_pointer(timestamp, metrics)?;
        }

        match target_root {
            None => {
                self.current = self.implicit.node;
                self.depth = self.implicit.depth;
            }
            Some(root) => {
                let context = self
                    .tasks
                    .get(target)
                    .ok_or_else(|| unknown_task(location, target))?
                    .context;
                self.tree.pause_chain(context.node, timestamp, metrics, true)?;
                let region = self.tree.get(root)?.kind.region();
                if let Some(region) = region {
                    self.enter_task_pointer(timestamp, region, metrics)?;
                }
                self.current = context.node;
                self.depth = context.depth;
            }
        }
        self.current_task = target;
        Ok(())
    }

    /// Closes `task`, whose outermost frame must be `region`, and merges
    /// its tree under the `Tasks` node.
    pub fn task_end(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        task: TaskId,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        self.check_metrics(metrics)?;
        let location = self.location;
        if task.is_implicit() {
            return Err(unknown_task(location, task));
        }
        if task != self.current_task {
            self.task_switch(timestamp, task, metrics)?;
        }
        self.close_frame(timestamp, region, metrics, true)?;
        let entry = self
            .tasks
            .remove(task)
            .ok_or_else(|| unknown_task(location, task))?;
        self.leave_task_pointer(timestamp, metrics)?;
        self.current = self.implicit.node;
        self.depth = self.implicit.depth;
        self.current_task = TaskId::IMPLICIT;

        let tasks_root = self
            .tree
            .find_or_create_child(self.root, NodeKind::Tasks, timestamp)?;
        self.tasks_root = Some(tasks_root);
        let finished = *self.tree.get(entry.root)?;
        let node = self.tree.get_mut(tasks_root)?;
        node.count += finished.count;
        node.inclusive_time
            .merge(&finished.inclusive_time, DenseMode::Accumulated);
        node.last_exit_time = node.last_exit_time.max(finished.last_exit_time);
        self.tree.merge_subtree(entry.root, tasks_root)
    }

    fn enter_task_pointer(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        let kind = NodeKind::TaskRoot(region);
        let pointer = self
            .tree
            .find_or_create_child(self.implicit.node, kind, timestamp)?;
        self.tree.start_visit(pointer, timestamp, metrics)?;
        self.implicit.node = pointer;
        self.implicit.depth += 1;
        Ok(())
    }

    fn leave_task_pointer(&mut self, timestamp: u64, metrics: &[u64]) -> Result<(), ProfileError> {
        let pointer = self.implicit.node;
        self.tree.end_visit(pointer, timestamp, metrics)?;
        self.implicit.node = self.tree.get(pointer)?.parent.unwrap_or(self.root);
        self.implicit.depth = self.implicit.depth.saturating_sub(1);
        Ok(())
    }
}

#[cold]
fn unknown_task(location: u32, task: TaskId) -> ProfileError {
    ProfileError::UnknownTask { location, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use libmeasure_alloc::Allocator;

    fn location() -> ProfileLocation {
        let allocator = Allocator::new(1 << 22, 4096).unwrap();
        let modes = vec![DenseMode::Accumulated].into();
        ProfileLocation::new(&allocator, 0, ProfileConfig::default(), modes).unwrap()
    }

    #[test]
    fn interleaved_tasks_exclude_suspended_time() {
        let defs = test_support::definitions();
        let (r1, r2) = (test_support::region(&defs, "t1"), test_support::region(&defs, "t2"));
        let (t1, t2) = (TaskId::new(0, 1), TaskId::new(0, 2));
        let mut loc = location();

        loc.task_begin(0, r1, t1, &[0]).unwrap();
        assert_eq!(loc.current_task(), t1);
        loc.task_begin(10, r2, t2, &[100]).unwrap();
        assert_eq!(loc.task_table().fill_level(), 2);
        loc.task_switch(30, t1, &[300]).unwrap();
        loc.task_end(45, r1, t1, &[450]).unwrap();
        assert_eq!(loc.current_task(), TaskId::IMPLICIT);
        assert_eq!(loc.current_node(), loc.root());

        let tasks = loc.tasks_root().unwrap();
        let t1_node = loc.tree().find_child(tasks, NodeKind::TaskRoot(r1)).unwrap();
        let node = loc.tree().node(t1_node).unwrap();
        assert_eq!(node.count, 1);
        assert_eq!(node.inclusive_time.sum, 25);
        assert_eq!(loc.tree().dense_metrics(t1_node)[0].sum, 250);

        loc.task_end(50, r2, t2, &[500]).unwrap();
        let t2_node = loc.tree().find_child(tasks, NodeKind::TaskRoot(r2)).unwrap();
        // t2 only ran from 10 to 30; it is resumed and ended at 50.
        assert_eq!(loc.tree().node(t2_node).unwrap().inclusive_time.sum, 20);
        assert_eq!(loc.tree().node(tasks).unwrap().count, 2);
        assert_eq!(loc.tree().node(tasks).unwrap().inclusive_time.sum, 45);
        assert_eq!(loc.task_table().fill_level(), 0);
        assert_eq!(loc.task_table().max_active(), 2);

        // Time spent in tasks is visible under the implicit task's node.
        let pointer = loc.find_path(&[NodeKind::TaskRoot(r1)]).unwrap();
        let pointer = loc.tree().node(pointer).unwrap();
        assert_eq!((pointer.count, pointer.inclusive_time.sum), (2, 25));
    }

    #[test]
    fn task_regions_nest_inside_the_task() {
        let defs = test_support::definitions();
        let (outer, task_region, inner) = (
            test_support::region(&defs, "parallel"),
            test_support::region(&defs, "task"),
            test_support::region(&defs, "work"),
        );
        let task = TaskId::new(0, 1);
        let mut loc = location();

        loc.enter(0, outer, &[0]).unwrap();
        loc.task_begin(1, task_region, task, &[0]).unwrap();
        loc.enter(2, inner, &[0]).unwrap();
        assert_eq!(loc.depth(), 2);
        loc.task_switch(3, TaskId::IMPLICIT, &[0]).unwrap();
        assert_eq!(loc.depth(), 1);
        loc.task_switch(7, task, &[0]).unwrap();
        loc.exit(8, inner, &[0]).unwrap();
        loc.task_end(9, task_region, task, &[0]).unwrap();
        loc.exit(10, outer, &[0]).unwrap();

        let work = loc
            .find_path(&[NodeKind::Tasks, NodeKind::TaskRoot(task_region), NodeKind::Region(inner)])
            .unwrap();
        assert_eq!(loc.tree().node(work).unwrap().inclusive_time.sum, 2);
        let pointer = loc
            .find_path(&[NodeKind::Region(outer), NodeKind::TaskRoot(task_region)])
            .unwrap();
        assert_eq!(loc.tree().node(pointer).unwrap().inclusive_time.sum, 4);
        assert_eq!(loc.depth(), 0);
    }

    #[test]
    fn repeated_tasks_merge() {
        let defs = test_support::definitions();
        let region = test_support::region(&defs, "task");
        let mut loc = location();
        for generation in 1..=3 {
            let task = TaskId::new(0, generation);
            let start = u64::from(generation) * 10;
            loc.task_begin(start, region, task, &[0]).unwrap();
            loc.task_end(start + 4, region, task, &[0]).unwrap();
        }
        let merged = loc.find_path(&[NodeKind::Tasks, NodeKind::TaskRoot(region)]).unwrap();
        let node = loc.tree().node(merged).unwrap();
        assert_eq!((node.count, node.inclusive_time.sum), (3, 12));
        // root, pointer, Tasks, one merged task root
        assert_eq!(loc.tree().node_count(), 4);
        assert_eq!(loc.task_table().max_active(), 1);
    }

    #[test]
    fn plain_exit_cannot_close_a_task() {
        let defs = test_support::definitions();
        let region = test_support::region(&defs, "task");
        let task = TaskId::new(0, 1);
        let mut loc = location();

        loc.task_begin(0, region, task, &[0]).unwrap();
        assert_eq!(
            loc.exit(1, region, &[0]),
            Err(ProfileError::ExitWithoutEnter { location: 0, region })
        );
        assert_eq!(loc.current_task(), task);
        assert_ne!(loc.current_node(), loc.root());
    }

    #[test]
    fn task_ids_must_be_unique_while_open() {
        let defs = test_support::definitions();
        let (r1, r2) = (test_support::region(&defs, "t1"), test_support::region(&defs, "t2"));
        let task = TaskId::new(0, 1);
        let mut loc = location();

        loc.task_begin(0, r1, task, &[0]).unwrap();
        loc.task_switch(1, TaskId::IMPLICIT, &[0]).unwrap();
        let nodes = loc.tree().node_count();
        assert_eq!(
            loc.task_begin(2, r2, task, &[0]),
            Err(ProfileError::DuplicateTask { location: 0, task })
        );
        assert_eq!(loc.tree().node_count(), nodes);
        assert_eq!(loc.task_table().fill_level(), 1);
        assert_eq!(loc.task_table().max_active(), 1);

        loc.task_end(3, r1, task, &[0]).unwrap();
        assert_eq!(loc.task_table().fill_level(), 0);
        // Once ended, the id may be reused.
        loc.task_begin(4, r2, task, &[0]).unwrap();
    }

    #[test]
    fn unknown_tasks_are_rejected() {
        let defs = test_support::definitions();
        let region = test_support::region(&defs, "task");
        let mut loc = location();
        let missing = TaskId::new(0, 9);
        assert_eq!(
            loc.task_switch(0, missing, &[0]),
            Err(ProfileError::UnknownTask { location: 0, task: missing })
        );
        assert_eq!(
            loc.task_end(0, region, missing, &[0]),
            Err(ProfileError::UnknownTask { location: 0, task: missing })
        );
        assert_eq!(loc.current_task(), TaskId::IMPLICIT);
    }
}
