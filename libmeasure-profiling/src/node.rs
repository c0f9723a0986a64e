// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{DenseMetric, DenseMode, ProfileError, SparseMetric, SparsePolicy, SparseValue};
use libmeasure_alloc::{Allocator, ObjectId, ObjectManager};
use libmeasure_definitions::{CallpathDef, Handle, MetricDef, ParameterDef, RegionDef, StringDef};
use std::sync::Arc;

/// What a node stands for. Siblings never share a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The root of a location's tree.
    ThreadRoot,
    Region(Handle<RegionDef>),
    ParameterInteger {
        parameter: Handle<ParameterDef>,
        value: i64,
    },
    ParameterString {
        parameter: Handle<ParameterDef>,
        value: Handle<StringDef>,
    },
    /// Absorbs every frame from `depth` down.
    Collapse { depth: u32 },
    /// Root of a task's own tree, or, under an implicit task's node, the
    /// time spent running tasks of that region from there.
    TaskRoot(Handle<RegionDef>),
    /// Parent of all completed task trees.
    Tasks,
}

impl NodeKind {
    /// Whether an exit closes this node for good, rather than passing
    /// through it like a parameter node.
    #[inline]
    pub(crate) fn closes_exit(self) -> bool {
        matches!(
            self,
            NodeKind::Region(_) | NodeKind::TaskRoot(_) | NodeKind::Collapse { .. }
        )
    }

    #[inline]
    pub(crate) fn region(self) -> Option<Handle<RegionDef>> {
        match self {
            NodeKind::Region(region) | NodeKind::TaskRoot(region) => Some(region),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProfileNode {
    pub kind: NodeKind,
    pub count: u64,
    pub inclusive_time: DenseMetric,
    pub first_enter_time: u64,
    pub last_exit_time: u64,
    /// Set by [`assign_callpaths`](crate::assign_callpaths).
    pub callpath: Option<Handle<CallpathDef>>,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) first_child: Option<ObjectId>,
    pub(crate) next_sibling: Option<ObjectId>,
    pub(crate) dense_metrics: Option<ObjectId>,
    pub(crate) first_int_sparse: Option<ObjectId>,
    pub(crate) first_double_sparse: Option<ObjectId>,
}

impl ProfileNode {
    fn new(kind: NodeKind, parent: Option<ObjectId>, timestamp: u64) -> Self {
        Self {
            kind,
            count: 0,
            inclusive_time: DenseMetric::new(),
            first_enter_time: timestamp,
            last_exit_time: timestamp,
            callpath: None,
            parent,
            first_child: None,
            next_sibling: None,
            dense_metrics: None,
            first_int_sparse: None,
            first_double_sparse: None,
        }
    }

    #[inline]
    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }
}

/// Storage of one location's nodes and their metrics, all carved from
/// arena pages.
pub struct CallTree {
    nodes: ObjectManager<ProfileNode>,
    dense: Option<ObjectManager<DenseMetric>>,
    modes: Arc<[DenseMode]>,
    sparse_int: ObjectManager<SparseMetric<u64>>,
    sparse_double: ObjectManager<SparseMetric<f64>>,
}

pub struct Children<'a> {
    tree: &'a CallTree,
    next: Option<ObjectId>,
}

impl Iterator for Children<'_> {
    type Item = ObjectId;

    fn next(&mut self) -> Option<ObjectId> {
        let id = self.next?;
        self.next = self.tree.node(id).and_then(|node| node.next_sibling);
        Some(id)
    }
}

/// Picks the sparse list of one value type.
pub(crate) trait SparseStore: SparseValue {
    fn store(tree: &CallTree) -> &ObjectManager<SparseMetric<Self>>;
    fn store_mut(tree: &mut CallTree) -> &mut ObjectManager<SparseMetric<Self>>;
    fn head(node: &mut ProfileNode) -> &mut Option<ObjectId>;
}

impl SparseStore for u64 {
    fn store(tree: &CallTree) -> &ObjectManager<SparseMetric<Self>> {
        &tree.sparse_int
    }
    fn store_mut(tree: &mut CallTree) -> &mut ObjectManager<SparseMetric<Self>> {
        &mut tree.sparse_int
    }
    fn head(node: &mut ProfileNode) -> &mut Option<ObjectId> {
        &mut node.first_int_sparse
    }
}

impl SparseStore for f64 {
    fn store(tree: &CallTree) -> &ObjectManager<SparseMetric<Self>> {
        &tree.sparse_double
    }
    fn store_mut(tree: &mut CallTree) -> &mut ObjectManager<SparseMetric<Self>> {
        &mut tree.sparse_double
    }
    fn head(node: &mut ProfileNode) -> &mut Option<ObjectId> {
        &mut node.first_double_sparse
    }
}

impl CallTree {
    pub(crate) fn new(
        allocator: &Allocator,
        modes: Arc<[DenseMode]>,
    ) -> Result<Self, ProfileError> {
        let dense = match modes.len() {
            0 => None,
            width => Some(ObjectManager::with_width(allocator, width)?),
        };
        Ok(Self {
            nodes: ObjectManager::new(allocator)?,
            dense,
            modes,
            sparse_int: ObjectManager::new(allocator)?,
            sparse_double: ObjectManager::new(allocator)?,
        })
    }

    /// Nodes currently in the tree, including detached task roots.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.live()
    }

    #[inline]
    pub fn dense_metric_count(&self) -> usize {
        self.modes.len()
    }

    #[inline]
    pub fn node(&self, id: ObjectId) -> Option<&ProfileNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: ObjectId) -> Children<'_> {
        Children {
            tree: self,
            next: self.node(id).and_then(|node| node.first_child),
        }
    }

    pub fn find_child(&self, parent: ObjectId, kind: NodeKind) -> Option<ObjectId> {
        self.children(parent)
            .find(|&child| self.node(child).is_some_and(|node| node.kind == kind))
    }

    /// The dense metrics of a node, in registration order.
    pub fn dense_metrics(&self, id: ObjectId) -> &[DenseMetric] {
        let slot = self.node(id).and_then(|node| node.dense_metrics);
        match (&self.dense, slot) {
            (Some(dense), Some(slot)) => dense.get_slice(slot).unwrap_or_default(),
            _ => &[],
        }
    }

    pub fn sparse_integers(&self, id: ObjectId) -> impl Iterator<Item = &SparseMetric<u64>> {
        self.sparse_list(self.node(id).and_then(|node| node.first_int_sparse))
    }

    pub fn sparse_doubles(&self, id: ObjectId) -> impl Iterator<Item = &SparseMetric<f64>> {
        self.sparse_list(self.node(id).and_then(|node| node.first_double_sparse))
    }

    fn sparse_list<V: SparseStore>(
        &self,
        head: Option<ObjectId>,
    ) -> impl Iterator<Item = &SparseMetric<V>> {
        let store = V::store(self);
        std::iter::successors(head.and_then(|id| store.get(id)), move |metric| {
            metric.next.and_then(|id| store.get(id))
        })
    }

    pub(crate) fn get(&self, id: ObjectId) -> Result<&ProfileNode, ProfileError> {
        self.nodes.get(id).ok_or(ProfileError::MissingNode(id.index()))
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Result<&mut ProfileNode, ProfileError> {
        self.nodes
            .get_mut(id)
            .ok_or(ProfileError::MissingNode(id.index()))
    }

    /// Allocates a node that no parent lists as a child yet.
    pub(crate) fn new_node(
        &mut self,
        kind: NodeKind,
        parent: Option<ObjectId>,
        timestamp: u64,
    ) -> Result<ObjectId, ProfileError> {
        let dense = match &mut self.dense {
            Some(dense) => Some(dense.alloc(DenseMetric::new())?),
            None => None,
        };
        let mut node = ProfileNode::new(kind, parent, timestamp);
        node.dense_metrics = dense;
        match self.nodes.alloc(node) {
            Ok(id) => Ok(id),
            Err(err) => {
                if let (Some(manager), Some(slot)) = (&mut self.dense, dense) {
                    manager.free(slot);
                }
                Err(err.into())
            }
        }
    }

    /// Returns the child of `parent` with `kind`, creating it as the last
    /// child if there is none.
    pub(crate) fn find_or_create_child(
        &mut self,
        parent: ObjectId,
        kind: NodeKind,
        timestamp: u64,
    ) -> Result<ObjectId, ProfileError> {
        if let Some(child) = self.find_child(parent, kind) {
            return Ok(child);
        }
        let child = self.new_node(kind, Some(parent), timestamp)?;
        self.link_child(parent, child)?;
        Ok(child)
    }

    /// Appends `child` to the children of `parent`.
    pub(crate) fn link_child(
        &mut self,
        parent: ObjectId,
        child: ObjectId,
    ) -> Result<(), ProfileError> {
        {
            let node = self.get_mut(child)?;
            node.parent = Some(parent);
            node.next_sibling = None;
        }
        match self.children(parent).last() {
            Some(last) => self.get_mut(last)?.next_sibling = Some(child),
            None => self.get_mut(parent)?.first_child = Some(child),
        }
        Ok(())
    }

    /// Starts a visit of `id`: counts it and records the start values.
    pub(crate) fn start_visit(
        &mut self,
        id: ObjectId,
        timestamp: u64,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        let node = self.get_mut(id)?;
        node.count += 1;
        node.inclusive_time.start(timestamp);
        let slot = node.dense_metrics;
        for (metric, value) in dense_slots(&mut self.dense, slot).iter_mut().zip(metrics) {
            metric.start(*value);
        }
        Ok(())
    }

    /// Closes one visit of `id`.
    pub(crate) fn end_visit(
        &mut self,
        id: ObjectId,
        timestamp: u64,
        metrics: &[u64],
    ) -> Result<(), ProfileError> {
        let node = self.get_mut(id)?;
        node.last_exit_time = timestamp;
        node.inclusive_time.update(timestamp, DenseMode::Accumulated);
        let slot = node.dense_metrics;
        let Self { dense, modes, .. } = self;
        for ((metric, value), mode) in dense_slots(dense, slot)
            .iter_mut()
            .zip(metrics)
            .zip(modes.iter())
        {
            metric.update(*value, *mode);
        }
        Ok(())
    }

    /// Copies the start values of `from` into `id`, for nodes that open
    /// without their own samples.
    pub(crate) fn inherit_start(
        &mut self,
        id: ObjectId,
        from: ObjectId,
    ) -> Result<(), ProfileError> {
        let source = *self.get(from)?;
        let starts: Vec<u64> = self
            .dense_metrics(from)
            .iter()
            .map(|metric| metric.start_value)
            .collect();
        let node = self.get_mut(id)?;
        node.count += 1;
        node.inclusive_time.start(source.inclusive_time.start_value);
        let slot = node.dense_metrics;
        for (metric, value) in dense_slots(&mut self.dense, slot).iter_mut().zip(starts) {
            metric.start(value);
        }
        Ok(())
    }

    /// Suspends (`resume == false`) or resumes every open node from `id` up
    /// to and including the first task root.
    pub(crate) fn pause_chain(
        &mut self,
        id: ObjectId,
        timestamp: u64,
        metrics: &[u64],
        resume: bool,
    ) -> Result<(), ProfileError> {
        let mut next = Some(id);
        while let Some(id) = next {
            let node = self.get_mut(id)?;
            let kind = node.kind;
            if kind == NodeKind::ThreadRoot {
                break;
            }
            if resume {
                node.inclusive_time.start(timestamp);
            } else {
                node.inclusive_time.suspend(timestamp);
            }
            next = node.parent;
            let slot = node.dense_metrics;
            for (metric, value) in dense_slots(&mut self.dense, slot).iter_mut().zip(metrics) {
                if resume {
                    metric.start(*value);
                } else {
                    metric.suspend(*value);
                }
            }
            if matches!(kind, NodeKind::TaskRoot(_)) {
                break;
            }
        }
        Ok(())
    }

    /// Adds `value` to the sparse metric `metric` of `id`, creating the
    /// entry with `policy()` on first use.
    pub(crate) fn trigger<V: SparseStore>(
        &mut self,
        id: ObjectId,
        metric: Handle<MetricDef>,
        value: V,
        policy: impl FnOnce() -> SparsePolicy,
    ) -> Result<(), ProfileError> {
        let head = *V::head(self.get_mut(id)?);
        let mut last = None;
        let mut next = head;
        while let Some(entry) = next {
            let sparse = V::store_mut(self)
                .get_mut(entry)
                .ok_or(ProfileError::MissingNode(entry.index()))?;
            if sparse.metric == metric {
                sparse.update(value);
                return Ok(());
            }
            last = Some(entry);
            next = sparse.next;
        }
        let created = V::store_mut(self).alloc(SparseMetric::new(metric, policy(), value))?;
        self.append_sparse::<V>(id, last, created)
    }

    fn append_sparse<V: SparseStore>(
        &mut self,
        id: ObjectId,
        last: Option<ObjectId>,
        entry: ObjectId,
    ) -> Result<(), ProfileError> {
        match last {
            Some(last) => {
                V::store_mut(self)
                    .get_mut(last)
                    .ok_or(ProfileError::MissingNode(last.index()))?
                    .next = Some(entry);
            }
            None => *V::head(self.get_mut(id)?) = Some(entry),
        }
        Ok(())
    }

    /// Moves the subtree rooted at `source` under `parent`, merging it into
    /// an existing child of the same kind where there is one. Nodes merged
    /// away go back to the free list.
    pub(crate) fn merge_subtree(
        &mut self,
        source: ObjectId,
        parent: ObjectId,
    ) -> Result<(), ProfileError> {
        let mut work = vec![(source, parent)];
        while let Some((source, parent)) = work.pop() {
            let kind = self.get(source)?.kind;
            match self.find_child(parent, kind) {
                None => self.link_child(parent, source)?,
                Some(target) => {
                    let children: Vec<ObjectId> = self.children(source).collect();
                    self.merge_node(target, source)?;
                    work.extend(children.into_iter().map(|child| (child, target)));
                    self.free_node(source)?;
                }
            }
        }
        Ok(())
    }

    /// Adds the statistics of `source` to `target`.
    pub(crate) fn merge_node(
        &mut self,
        target: ObjectId,
        source: ObjectId,
    ) -> Result<(), ProfileError> {
        let from = *self.get(source)?;
        let to = self.get_mut(target)?;
        to.count += from.count;
        to.inclusive_time.merge(&from.inclusive_time, DenseMode::Accumulated);
        to.first_enter_time = to.first_enter_time.min(from.first_enter_time);
        to.last_exit_time = to.last_exit_time.max(from.last_exit_time);
        let target_slot = to.dense_metrics;

        let sources: Vec<DenseMetric> = self.dense_metrics(source).to_vec();
        let Self { dense, modes, .. } = self;
        for ((metric, other), mode) in dense_slots(dense, target_slot)
            .iter_mut()
            .zip(&sources)
            .zip(modes.iter())
        {
            metric.merge(other, *mode);
        }

        self.merge_sparse::<u64>(target, from.first_int_sparse)?;
        self.merge_sparse::<f64>(target, from.first_double_sparse)?;
        // The source's sparse entries now belong to the target or are freed.
        let source = self.get_mut(source)?;
        source.first_int_sparse = None;
        source.first_double_sparse = None;
        Ok(())
    }

    fn merge_sparse<V: SparseStore>(
        &mut self,
        target: ObjectId,
        head: Option<ObjectId>,
    ) -> Result<(), ProfileError> {
        let mut next = head;
        while let Some(entry) = next {
            let moved = *V::store(self)
                .get(entry)
                .ok_or(ProfileError::MissingNode(entry.index()))?;
            next = moved.next;

            let mut last = None;
            let mut cursor = *V::head(self.get_mut(target)?);
            let mut merged = false;
            while let Some(existing) = cursor {
                let sparse = V::store_mut(self)
                    .get_mut(existing)
                    .ok_or(ProfileError::MissingNode(existing.index()))?;
                if sparse.metric == moved.metric {
                    sparse.merge(&moved);
                    merged = true;
                    break;
                }
                last = Some(existing);
                cursor = sparse.next;
            }
            if merged {
                V::store_mut(self).free(entry);
            } else {
                if let Some(sparse) = V::store_mut(self).get_mut(entry) {
                    sparse.next = None;
                }
                self.append_sparse::<V>(target, last, entry)?;
            }
        }
        Ok(())
    }

    /// Frees one node with its metrics. Children are left alone.
    pub(crate) fn free_node(&mut self, id: ObjectId) -> Result<(), ProfileError> {
        let node = *self.get(id)?;
        if let (Some(dense), Some(slot)) = (&mut self.dense, node.dense_metrics) {
            dense.free(slot);
        }
        self.free_sparse::<u64>(node.first_int_sparse);
        self.free_sparse::<f64>(node.first_double_sparse);
        self.nodes.free(id);
        Ok(())
    }

    fn free_sparse<V: SparseStore>(&mut self, head: Option<ObjectId>) {
        let mut next = head;
        while let Some(entry) = next {
            next = V::store(self).get(entry).and_then(|sparse| sparse.next);
            V::store_mut(self).free(entry);
        }
    }
}

fn dense_slots(
    dense: &mut Option<ObjectManager<DenseMetric>>,
    slot: Option<ObjectId>,
) -> &mut [DenseMetric] {
    match (dense, slot) {
        (Some(dense), Some(slot)) => dense.get_slice_mut(slot).unwrap_or_default(),
        _ => &mut [],
    }
}

impl core::fmt::Debug for CallTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallTree")
            .field("nodes", &self.nodes.live())
            .field("dense_metrics", &self.modes.len())
            .field("sparse_int", &self.sparse_int.live())
            .field("sparse_double", &self.sparse_double.live())
            .finish()
    }
}
