// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::*;
use libmeasure_alloc::{Allocator, ObjectId};
use libmeasure_definitions::{Handle, MetricDef, ParameterDef, RegionDef, StringDef};
use libmeasure_measurement::TaskId;
use std::sync::Arc;

/// The profile of one location: its call tree plus the cursor events move
/// through it.
#[derive(Debug)]
pub struct ProfileLocation {
    pub(crate) location: u32,
    pub(crate) tree: CallTree,
    pub(crate) root: ObjectId,
    pub(crate) tasks_root: Option<ObjectId>,
    /// Innermost open node of the running task.
    pub(crate) current: ObjectId,
    /// Open frames of the running task, collapsed frames included.
    pub(crate) depth: u32,
    pub(crate) current_task: TaskId,
    /// Saved position of the implicit task while an explicit one runs.
    pub(crate) implicit: TaskContext,
    pub(crate) tasks: TaskTable,
    config: ProfileConfig,
    has_collapse_node: bool,
    reached_depth: u32,
}

impl ProfileLocation {
    pub fn new(
        allocator: &Allocator,
        location: u32,
        config: ProfileConfig,
        dense_modes: Arc<[DenseMode]>,
    ) -> Result<Self, ProfileError> {
        let mut tree = CallTree::new(allocator, dense_modes)?;
        let root = tree.new_node(NodeKind::ThreadRoot, None, 0)?;
        Ok(Self {
            location,
            tree,
            root,
            tasks_root: None,
            current: root,
            depth: 0,
            current_task: TaskId::IMPLICIT,
            implicit: TaskContext {
                node: root,
                depth: 0,
            },
            tasks: TaskTable::new(allocator, config.task_table_size)?,
            config,
            has_collapse_node: false,
            reached_depth: 0,
        })
    }

    #[inline]
    pub fn location_id(&self) -> u32 {
        self.location
    }

    #[inline]
    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    #[inline]
    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// The artificial parent of completed tasks, once a task ended.
    #[inline]
    pub fn tasks_root(&self) -> Option<ObjectId> {
        self.tasks_root
    }

    #[inline]
    pub fn current_node(&self) -> ObjectId {
        self.current
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn current_task(&self) -> TaskId {
        self.current_task
    }

    #[inline]
    pub fn task_table(&self) -> &TaskTable {
        &self.tasks
    }

    #[inline]
    pub fn has_collapse_node(&self) -> bool {
        self.has_collapse_node
    }

    /// Deepest frame seen below a collapse node.
    #[inline]
    pub fn reached_depth(&self) -> u32 {
        self.reached_depth
    }

    /// Follows `path` from the root, one child kind per step.
    pub fn find_path(&self, path: &[NodeKind]) -> Option<ObjectId> {
        path.iter()
            .try_fold(self.root, |node, kind| self.tree.find_child(node, *kind))
    }

    pub(crate) fn check_metrics(&self, metrics: &[u64]) -> Result<(), ProfileError> {
        let expected = self.tree.dense_metric_count();
        if metrics.len() != expected {
            return Err(ProfileError::MetricCount {
                expected,
                got: metrics.len(),
            });
        }
        Ok(())
    }

    pub fn enter(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        self.check_metrics(metrics)?;
        self.depth += 1;
        let current = self.tree.get(self.current)?;
        if let NodeKind::Collapse { .. } = current.kind {
            self.reached_depth = self.reached_depth.max(self.depth);
            return Ok(());
        }

        let kind = NodeKind::Region(region);
        let node = match self.tree.find_child(self.current, kind) {
            Some(node) if self.depth <= self.config.max_callpath_depth => node,
            _ => {
                let kind = if self.depth > self.config.max_callpath_depth
                    || self.tree.node_count() as u64 >= self.config.max_callpath_num
                {
                    self.has_collapse_node = true;
                    self.reached_depth = self.reached_depth.max(self.depth);
                    NodeKind::Collapse { depth: self.depth }
                } else {
                    kind
                };
                self.tree.find_or_create_child(self.current, kind, timestamp)?
            }
        };
        self.tree.start_visit(node, timestamp, metrics)?;
        self.current = node;
        Ok(())
    }

    /// Closes the innermost region, which must be `region`. The outermost
    /// frame of a running task is only closed by `task_end`.
    pub fn exit(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        self.close_frame(timestamp, region, metrics, false)
    }

    pub(crate) fn close_frame(
        &mut self,
        timestamp: u64,
        region: Handle<RegionDef>,
        metrics: &[u64],
        task_root: bool,
    ) -> Result<(), ProfileError> {
        self.check_metrics(metrics)?;
        let without_enter = ProfileError::ExitWithoutEnter {
            location: self.location,
            region,
        };
        if self.current == self.root {
            return Err(without_enter);
        }
        if let NodeKind::Collapse { depth } = self.tree.get(self.current)?.kind {
            if self.depth > depth {
                self.depth -= 1;
                return Ok(());
            }
        }

        // Parameter nodes close together with the region that owns them.
        let mut node = self.current;
        let closed = loop {
            if !task_root && matches!(self.tree.get(node)?.kind, NodeKind::TaskRoot(_)) {
                return Err(without_enter);
            }
            self.depth = self.depth.saturating_sub(1);
            self.tree.end_visit(node, timestamp, metrics)?;
            let data = self.tree.get(node)?;
            if data.kind.closes_exit() {
                break *data;
            }
            match data.parent {
                Some(parent) if parent != self.root => node = parent,
                _ => return Err(without_enter),
            }
        };
        if let Some(expected) = closed.kind.region() {
            if expected != region {
                return Err(ProfileError::ExitMismatch {
                    location: self.location,
                    expected,
                    exited: region,
                });
            }
        }
        self.current = closed.parent.unwrap_or(self.root);
        Ok(())
    }

    /// Records a parameter value as a child of the current node; it is
    /// closed by the next exit. Ignored at the depth limit.
    pub fn parameter_integer(
        &mut self,
        timestamp: u64,
        parameter: Handle<ParameterDef>,
        value: i64,
    ) -> Result<(), ProfileError> {
        self.enter_parameter(timestamp, NodeKind::ParameterInteger { parameter, value })
    }

    pub fn parameter_string(
        &mut self,
        timestamp: u64,
        parameter: Handle<ParameterDef>,
        value: Handle<StringDef>,
    ) -> Result<(), ProfileError> {
        self.enter_parameter(timestamp, NodeKind::ParameterString { parameter, value })
    }

    fn enter_parameter(&mut self, timestamp: u64, kind: NodeKind) -> Result<(), ProfileError> {
        let parent = self.current;
        if matches!(self.tree.get(parent)?.kind, NodeKind::Collapse { .. })
            || self.depth >= self.config.max_callpath_depth
        {
            return Ok(());
        }
        let node = self.tree.find_or_create_child(parent, kind, timestamp)?;
        self.tree.inherit_start(node, parent)?;
        self.depth += 1;
        self.current = node;
        Ok(())
    }

    pub fn trigger_integer(
        &mut self,
        metric: Handle<MetricDef>,
        value: u64,
        policy: impl FnOnce() -> SparsePolicy,
    ) -> Result<(), ProfileError> {
        self.tree.trigger(self.current, metric, value, policy)
    }

    pub fn trigger_double(
        &mut self,
        metric: Handle<MetricDef>,
        value: f64,
        policy: impl FnOnce() -> SparsePolicy,
    ) -> Result<(), ProfileError> {
        self.tree.trigger(self.current, metric, value, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use libmeasure_definitions::{MetricMode, ParameterType};

    fn location(config: ProfileConfig, dense: usize) -> ProfileLocation {
        let allocator = Allocator::new(1 << 22, 4096).unwrap();
        ProfileLocation::new(&allocator, 3, config, vec![DenseMode::Accumulated; dense].into())
            .unwrap()
    }

    #[test]
    fn revisits_reuse_nodes() {
        let defs = test_support::definitions();
        let (a, b) = (test_support::region(&defs, "a"), test_support::region(&defs, "b"));
        let mut loc = location(ProfileConfig::default(), 1);
        loc.enter(0, a, &[0]).unwrap();
        loc.enter(1, b, &[10]).unwrap();
        loc.exit(3, b, &[12]).unwrap();
        loc.enter(4, b, &[20]).unwrap();
        loc.exit(9, b, &[30]).unwrap();
        loc.exit(10, a, &[31]).unwrap();

        let a_node = loc.find_path(&[NodeKind::Region(a)]).unwrap();
        let b_node = loc.find_path(&[NodeKind::Region(a), NodeKind::Region(b)]).unwrap();
        assert_eq!(loc.tree().node(a_node).unwrap().count, 1);
        assert_eq!(loc.tree().node(b_node).unwrap().count, 2);
        assert_eq!(loc.tree().node(b_node).unwrap().inclusive_time.sum, 7);
        assert_eq!(loc.tree().dense_metrics(b_node)[0].sum, 12);
        assert_eq!(loc.tree().node(a_node).unwrap().inclusive_time.sum, 10);
        assert_eq!(loc.tree().node_count(), 3);
        assert_eq!(loc.current_node(), loc.root());
        assert_eq!(loc.depth(), 0);
    }

    #[test]
    fn deep_recursion_collapses_once() {
        let defs = test_support::definitions();
        let r = test_support::region(&defs, "recurse");
        let config = ProfileConfig {
            max_callpath_depth: 4,
            ..ProfileConfig::default()
        };
        for extra in [5u32, 50] {
            let mut loc = location(config, 0);
            let total = config.max_callpath_depth + extra;
            for t in 0..total {
                loc.enter(u64::from(t), r, &[]).unwrap();
            }
            for t in 0..total {
                loc.exit(u64::from(total + t), r, &[]).unwrap();
            }
            assert_eq!(loc.depth(), 0);
            assert_eq!(loc.current_node(), loc.root());
            // root, four regular frames, one collapse node
            assert_eq!(loc.tree().node_count(), 6);
            assert!(loc.has_collapse_node());
            assert_eq!(loc.reached_depth(), total);

            let mut path = vec![NodeKind::Region(r); 4];
            path.push(NodeKind::Collapse { depth: 5 });
            let collapse = loc.find_path(&path).unwrap();
            assert_eq!(loc.tree().node(collapse).unwrap().count, 1);
            assert_eq!(loc.tree().children(collapse).count(), 0);
        }
    }

    #[test]
    fn node_budget_collapses_new_frames() {
        let defs = test_support::definitions();
        let regions: Vec<_> = (0..10)
            .map(|i| test_support::region(&defs, &format!("r{i}")))
            .collect();
        let config = ProfileConfig {
            max_callpath_num: 4,
            ..ProfileConfig::default()
        };
        let mut loc = location(config, 0);
        for (t, region) in regions.iter().enumerate() {
            loc.enter(t as u64, *region, &[]).unwrap();
            loc.exit(t as u64 + 1, *region, &[]).unwrap();
        }
        // root, r0, r1, r2, then one collapse node for everything else
        assert_eq!(loc.tree().node_count(), 5);
        assert!(loc
            .find_path(&[NodeKind::Collapse { depth: 1 }])
            .is_some_and(|id| loc.tree().node(id).unwrap().count == 7));
        // Existing nodes stay reachable.
        loc.enter(100, regions[1], &[]).unwrap();
        assert_eq!(loc.current_node(), loc.find_path(&[NodeKind::Region(regions[1])]).unwrap());
    }

    #[test]
    fn exit_errors() {
        let defs = test_support::definitions();
        let (a, b) = (test_support::region(&defs, "a"), test_support::region(&defs, "b"));
        let mut loc = location(ProfileConfig::default(), 0);
        assert_eq!(
            loc.exit(0, a, &[]),
            Err(ProfileError::ExitWithoutEnter { location: 3, region: a })
        );
        loc.enter(1, a, &[]).unwrap();
        assert_eq!(
            loc.exit(2, b, &[]),
            Err(ProfileError::ExitMismatch {
                location: 3,
                expected: a,
                exited: b
            })
        );
        assert_eq!(
            loc.enter(3, a, &[1]),
            Err(ProfileError::MetricCount { expected: 0, got: 1 })
        );
    }

    #[test]
    fn parameters_close_with_their_region() {
        let defs = test_support::definitions();
        let a = test_support::region(&defs, "a");
        let size = defs.define_parameter("size", ParameterType::Int64).unwrap();
        let mode = defs.define_parameter("mode", ParameterType::String).unwrap();
        let fast = defs.define_string("fast").unwrap();
        let mut loc = location(ProfileConfig::default(), 0);

        for (t, value) in [(0u64, 1i64), (10, 2), (20, 1)] {
            loc.enter(t, a, &[]).unwrap();
            loc.parameter_integer(t + 1, size, value).unwrap();
            loc.parameter_string(t + 1, mode, fast).unwrap();
            assert_eq!(loc.depth(), 3);
            loc.exit(t + 5, a, &[]).unwrap();
            assert_eq!(loc.depth(), 0);
        }

        let one = loc
            .find_path(&[
                NodeKind::Region(a),
                NodeKind::ParameterInteger { parameter: size, value: 1 },
                NodeKind::ParameterString { parameter: mode, value: fast },
            ])
            .unwrap();
        let node = loc.tree().node(one).unwrap();
        assert_eq!(node.count, 2);
        // Parameter nodes start with their parent's start value.
        assert_eq!(node.inclusive_time.sum, 10);
        let a_node = loc.find_path(&[NodeKind::Region(a)]).unwrap();
        assert_eq!(loc.tree().children(a_node).count(), 2);
    }

    #[test]
    fn triggers_attach_to_current_node() {
        let defs = test_support::definitions();
        let a = test_support::region(&defs, "a");
        let bytes = test_support::metric(&defs, "bytes", MetricMode::AccumulatedStart);
        let mut loc = location(ProfileConfig::default(), 0);
        loc.trigger_integer(bytes, 1, || SparsePolicy::Sum).unwrap();
        loc.enter(0, a, &[]).unwrap();
        loc.trigger_integer(bytes, 40, || SparsePolicy::Sum).unwrap();
        loc.trigger_integer(bytes, 2, || SparsePolicy::Sum).unwrap();
        loc.trigger_double(bytes, 0.25, || SparsePolicy::Max).unwrap();
        loc.exit(1, a, &[]).unwrap();

        let a_node = loc.find_path(&[NodeKind::Region(a)]).unwrap();
        let ints: Vec<_> = loc.tree().sparse_integers(a_node).map(|m| m.value()).collect();
        assert_eq!(ints, vec![42]);
        assert_eq!(loc.tree().sparse_doubles(a_node).count(), 1);
        assert_eq!(loc.tree().sparse_integers(loc.root()).count(), 1);
    }
}
