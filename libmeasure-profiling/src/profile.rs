// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::*;
use libmeasure_alloc::Allocator;
use libmeasure_definitions::{
    DefinitionError, DefinitionKind, DefinitionManager, Handle, MetricBase, MetricDef, MetricMode,
    MetricProfilingType, MetricSourceType, MetricValueType, NewMetric,
};
use libmeasure_measurement::{
    ErrorReporter, EventCallbacks, Location, MeasurementContext, Substrate, SubstrateId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_ACTIVE_TASKS_METRIC: &str = "max active tasks";

/// The profiling substrate. Builds a [`ProfileLocation`] per location and
/// keeps the finished ones until they are taken.
///
/// The first error any location hits turns profiling off for the whole
/// process; it is reported once through the context's [`ErrorReporter`].
pub struct Profile {
    definitions: Arc<DefinitionManager>,
    allocator: Allocator,
    reporter: ErrorReporter,
    config: ProfileConfig,
    dense_metrics: Vec<Handle<MetricDef>>,
    dense_modes: Arc<[DenseMode]>,
    max_active_tasks: Handle<MetricDef>,
    enabled: AtomicBool,
    finished: Mutex<Vec<ProfileLocation>>,
}

impl Profile {
    /// Creates the substrate without registering it. `dense_metrics` are
    /// the values every enter and exit carries, in order.
    pub fn new(
        context: &MeasurementContext,
        config: ProfileConfig,
        dense_metrics: &[Handle<MetricDef>],
    ) -> Result<Arc<Self>, ProfileError> {
        let definitions = context.definitions().clone();
        let dense_modes = dense_metrics
            .iter()
            .map(|&metric| {
                definitions
                    .get(metric)
                    .map(|def| DenseMode::of(&def))
                    .ok_or(DefinitionError::InvalidHandle {
                        kind: DefinitionKind::Metric,
                        id: metric.id(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let max_active_tasks = definitions.define_metric(NewMetric {
            name: MAX_ACTIVE_TASKS_METRIC,
            description: "Maximum number of tasks open at the same time on a location",
            source_type: MetricSourceType::Task,
            mode: MetricMode::AccumulatedStart,
            value_type: MetricValueType::Double,
            base: MetricBase::Decimal,
            exponent: 0,
            unit: "#",
            profiling_type: MetricProfilingType::Max,
        })?;
        let enabled = context.config().enable_profiling;
        debug!(
            dense_metrics = dense_modes.len(),
            ?config,
            enabled,
            "Created profiling substrate"
        );
        Ok(Arc::new(Self {
            definitions,
            allocator: context.allocator().clone(),
            reporter: context.reporter().clone(),
            config,
            dense_metrics: dense_metrics.to_vec(),
            dense_modes: dense_modes.into(),
            max_active_tasks,
            enabled: AtomicBool::new(enabled),
            finished: Mutex::new(Vec::new()),
        }))
    }

    /// Creates the substrate and registers it with `context`.
    pub fn register(
        context: &MeasurementContext,
        config: ProfileConfig,
        dense_metrics: &[Handle<MetricDef>],
    ) -> Result<Arc<Self>, ProfileError> {
        let profile = Self::new(context, config, dense_metrics)?;
        context.register_substrate(profile.clone());
        Ok(profile)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    pub fn dense_metrics(&self) -> &[Handle<MetricDef>] {
        &self.dense_metrics
    }

    pub fn max_active_tasks_metric(&self) -> Handle<MetricDef> {
        self.max_active_tasks
    }

    /// Number of finalized locations not taken yet.
    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Runs `f` over the finalized locations.
    pub fn with_locations<R>(&self, f: impl FnOnce(&mut [ProfileLocation]) -> R) -> R {
        f(&mut self.finished.lock())
    }

    pub fn take_locations(&self) -> Vec<ProfileLocation> {
        std::mem::take(&mut *self.finished.lock())
    }

    /// Defines callpaths for every finalized location.
    pub fn assign_callpaths(&self) -> Result<usize, ProfileError> {
        let mut finished = self.finished.lock();
        let mut visited = 0;
        for location in finished.iter_mut() {
            visited += assign_callpaths(&self.definitions, location)?;
        }
        Ok(visited)
    }

    /// Whether any finalized location collapsed frames, and the deepest
    /// frame one of them reached.
    pub fn collapse_summary(&self) -> Option<u32> {
        self.finished
            .lock()
            .iter()
            .filter(|location| location.has_collapse_node())
            .map(ProfileLocation::reached_depth)
            .max()
    }

    /// Turns profiling off for good, reporting `err` the first time.
    #[cold]
    fn stop(&self, err: &ProfileError) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            self.reporter.report("profiling", err.fault_kind(), err);
            warn!("Profiling is disabled for the rest of the run");
        }
    }

    fn on_event(
        &self,
        location: &mut Location,
        id: SubstrateId,
        event: impl FnOnce(&mut ProfileLocation) -> Result<(), ProfileError>,
    ) {
        if !self.is_enabled() {
            return;
        }
        // Locations created before registration have no profile.
        let Some(profile) = location.substrate_data_mut::<ProfileLocation>(id) else {
            return;
        };
        if let Err(err) = event(profile) {
            self.stop(&err);
        }
    }

    fn sparse_policy(&self, metric: Handle<MetricDef>) -> SparsePolicy {
        self.definitions
            .get(metric)
            .map_or(SparsePolicy::Sum, |def| SparsePolicy::of(&def))
    }

    fn create_location(&self, location: &mut Location, id: SubstrateId) {
        if !self.is_enabled() {
            return;
        }
        let created = ProfileLocation::new(
            &self.allocator,
            location.id(),
            self.config,
            self.dense_modes.clone(),
        );
        match created {
            Ok(profile) => location.set_substrate_data(id, profile),
            Err(err) => self.stop(&err),
        }
    }

    fn finalize_location(&self, location: &mut Location, id: SubstrateId) {
        let Some(mut profile) = location.take_substrate_data::<ProfileLocation>(id) else {
            return;
        };
        if !self.is_enabled() {
            return;
        }
        let max_active = profile.tasks.max_active();
        if max_active > 0 {
            let root = profile.root;
            if let Err(err) = profile.tree.trigger(
                root,
                self.max_active_tasks,
                max_active as f64,
                || SparsePolicy::Max,
            ) {
                self.stop(&err);
                return;
            }
        }
        debug!(
            location = profile.location_id(),
            nodes = profile.tree().node_count(),
            "Finalized location profile"
        );
        self.finished.lock().push(profile);
    }
}

impl Substrate for Profile {
    fn name(&self) -> &'static str {
        "profiling"
    }

    fn register(self: Arc<Self>, id: SubstrateId, callbacks: &mut EventCallbacks) {
        let this = self.clone();
        callbacks
            .location_creation
            .push(Arc::new(move |location| this.create_location(location, id)));
        let this = self.clone();
        callbacks
            .location_finalize
            .push(Arc::new(move |location| this.finalize_location(location, id)));

        let this = self.clone();
        callbacks
            .enter
            .push(Arc::new(move |location, timestamp, region, metrics| {
                this.on_event(location, id, |p| p.enter(timestamp, region, metrics))
            }));
        let this = self.clone();
        callbacks
            .exit
            .push(Arc::new(move |location, timestamp, region, metrics| {
                this.on_event(location, id, |p| p.exit(timestamp, region, metrics))
            }));

        let this = self.clone();
        callbacks
            .trigger_integer
            .push(Arc::new(move |location, _, metric, value| {
                this.on_event(location, id, |p| {
                    p.trigger_integer(metric, value, || this.sparse_policy(metric))
                })
            }));
        let this = self.clone();
        callbacks
            .trigger_double
            .push(Arc::new(move |location, _, metric, value| {
                this.on_event(location, id, |p| {
                    p.trigger_double(metric, value, || this.sparse_policy(metric))
                })
            }));

        let this = self.clone();
        callbacks
            .parameter_integer
            .push(Arc::new(move |location, timestamp, parameter, value| {
                this.on_event(location, id, |p| {
                    p.parameter_integer(timestamp, parameter, value)
                })
            }));
        let this = self.clone();
        callbacks
            .parameter_string
            .push(Arc::new(move |location, timestamp, parameter, value| {
                this.on_event(location, id, |p| p.parameter_string(timestamp, parameter, value))
            }));

        let this = self.clone();
        callbacks
            .task_begin
            .push(Arc::new(move |location, timestamp, region, task, metrics| {
                this.on_event(location, id, |p| {
                    p.task_begin(timestamp, region, task, metrics)
                })
            }));
        let this = self.clone();
        callbacks
            .task_switch
            .push(Arc::new(move |location, timestamp, task, metrics| {
                this.on_event(location, id, |p| p.task_switch(timestamp, task, metrics))
            }));
        callbacks
            .task_end
            .push(Arc::new(move |location, timestamp, region, task, metrics| {
                self.on_event(location, id, |p| {
                    p.task_end(timestamp, region, task, metrics)
                })
            }));
    }
}

impl core::fmt::Debug for Profile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Profile")
            .field("config", &self.config)
            .field("dense_metrics", &self.dense_metrics)
            .field("enabled", &self.is_enabled())
            .field("finished", &self.finished_count())
            .finish_non_exhaustive()
    }
}
