// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_alloc::ObjectId;
use libmeasure_definitions::{Handle, MetricDef, MetricMode, MetricProfilingType};

/// How a dense metric turns the value sampled at exit into a statistic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenseMode {
    /// The difference between exit and enter is summed up.
    Accumulated,
    /// The value sampled at exit is summed up as is.
    AbsolutePoint,
    /// The largest difference between exit and enter is kept.
    Max,
}

impl DenseMode {
    pub fn of(metric: &MetricDef) -> Self {
        match (metric.mode, metric.profiling_type) {
            (_, MetricProfilingType::Max) => DenseMode::Max,
            (MetricMode::AbsolutePoint | MetricMode::AbsoluteLast, _) => DenseMode::AbsolutePoint,
            _ => DenseMode::Accumulated,
        }
    }
}

/// Statistics of a metric every node carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DenseMetric {
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub squares: u64,
    /// Value sampled when the node was last entered or resumed.
    pub start_value: u64,
    /// Portion accumulated before the owning task was suspended.
    pub intermediate_sum: u64,
}

impl Default for DenseMetric {
    fn default() -> Self {
        Self {
            sum: 0,
            min: u64::MAX,
            max: 0,
            squares: 0,
            start_value: 0,
            intermediate_sum: 0,
        }
    }
}

impl DenseMetric {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn start(&mut self, value: u64) {
        self.start_value = value;
    }

    /// Closes one visit with `end_value` sampled at exit.
    pub(crate) fn update(&mut self, end_value: u64, mode: DenseMode) {
        let sample = match mode {
            DenseMode::AbsolutePoint => end_value,
            DenseMode::Accumulated | DenseMode::Max => end_value
                .wrapping_sub(self.start_value)
                .wrapping_add(self.intermediate_sum),
        };
        self.intermediate_sum = 0;
        self.sum = match mode {
            DenseMode::Max => self.sum.max(sample),
            DenseMode::Accumulated | DenseMode::AbsolutePoint => self.sum.wrapping_add(sample),
        };
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        self.squares = self.squares.wrapping_add(sample.wrapping_mul(sample));
    }

    /// Parks the running portion of the current visit.
    #[inline]
    pub(crate) fn suspend(&mut self, now: u64) {
        self.intermediate_sum = self
            .intermediate_sum
            .wrapping_add(now.wrapping_sub(self.start_value));
    }

    pub(crate) fn merge(&mut self, other: &DenseMetric, mode: DenseMode) {
        self.sum = match mode {
            DenseMode::Max => self.sum.max(other.sum),
            DenseMode::Accumulated | DenseMode::AbsolutePoint => self.sum.wrapping_add(other.sum),
        };
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.squares = self.squares.wrapping_add(other.squares);
        self.intermediate_sum = self.intermediate_sum.wrapping_add(other.intermediate_sum);
    }
}

/// Which statistic [`SparseMetric::value`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SparsePolicy {
    Sum,
    Max,
    Replace,
}

impl SparsePolicy {
    pub fn of(metric: &MetricDef) -> Self {
        match (metric.mode, metric.profiling_type) {
            (_, MetricProfilingType::Max) => SparsePolicy::Max,
            (
                MetricMode::AccumulatedLast | MetricMode::AbsoluteLast | MetricMode::RelativeLast,
                _,
            ) => SparsePolicy::Replace,
            _ => SparsePolicy::Sum,
        }
    }
}

pub trait SparseValue: Copy + PartialOrd + core::fmt::Debug + 'static {
    fn accumulate(self, other: Self) -> Self;
    fn square(self) -> Self;
}

impl SparseValue for u64 {
    #[inline]
    fn accumulate(self, other: Self) -> Self {
        self.wrapping_add(other)
    }

    #[inline]
    fn square(self) -> Self {
        self.wrapping_mul(self)
    }
}

impl SparseValue for f64 {
    #[inline]
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn square(self) -> Self {
        self * self
    }
}

/// A metric only some nodes carry, kept in a per-node list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SparseMetric<V> {
    pub metric: Handle<MetricDef>,
    pub policy: SparsePolicy,
    pub count: u64,
    pub sum: V,
    pub min: V,
    pub max: V,
    pub squares: V,
    pub last: V,
    pub(crate) next: Option<ObjectId>,
}

impl<V: SparseValue> SparseMetric<V> {
    pub(crate) fn new(metric: Handle<MetricDef>, policy: SparsePolicy, value: V) -> Self {
        Self {
            metric,
            policy,
            count: 1,
            sum: value,
            min: value,
            max: value,
            squares: value.square(),
            last: value,
            next: None,
        }
    }

    pub(crate) fn update(&mut self, value: V) {
        self.count += 1;
        self.sum = self.sum.accumulate(value);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.squares = self.squares.accumulate(value.square());
        self.last = value;
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum = self.sum.accumulate(other.sum);
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.squares = self.squares.accumulate(other.squares);
        self.last = other.last;
    }

    /// The value this metric reports for its node.
    pub fn value(&self) -> V {
        match self.policy {
            SparsePolicy::Sum => self.sum,
            SparsePolicy::Max => self.max,
            SparsePolicy::Replace => self.last,
        }
    }
}
