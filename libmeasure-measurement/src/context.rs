// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::logger::{self, LogTarget};
use crate::*;
use libmeasure_alloc::Allocator;
use libmeasure_definitions::collective::Collective;
use libmeasure_definitions::{
    unify, DefinitionManager, Handle, MetricDef, ParameterDef, RegionDef, StringDef,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one measured process shares between its locations. Tests may
/// create several independent contexts in one process.
#[derive(Debug)]
pub struct MeasurementContext {
    config: MeasurementConfig,
    allocator: Allocator,
    definitions: Arc<DefinitionManager>,
    dispatch: SubstrateDispatch,
    reporter: ErrorReporter,
    next_location: AtomicU32,
}

impl MeasurementContext {
    pub fn new(config: MeasurementConfig) -> Result<Self, MeasurementError> {
        if config.verbose {
            if let Err(e) = logger::init(LogTarget::Err) {
                warn!("{e}");
            }
        }
        let allocator = Allocator::new(config.total_memory, config.page_size).map_err(|_| {
            MeasurementError::Arena {
                total_memory: config.total_memory,
                page_size: config.page_size,
            }
        })?;
        info!(
            total_memory = allocator.total_memory(),
            page_size = allocator.page_size(),
            pages = allocator.page_count(),
            "Measurement initialized"
        );
        Ok(Self {
            definitions: Arc::new(DefinitionManager::new(&allocator)),
            allocator,
            config,
            dispatch: SubstrateDispatch::new(),
            reporter: ErrorReporter::new(),
            next_location: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    #[inline]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[inline]
    pub fn definitions(&self) -> &Arc<DefinitionManager> {
        &self.definitions
    }

    #[inline]
    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    #[inline]
    pub fn dispatch(&self) -> &SubstrateDispatch {
        &self.dispatch
    }

    /// Registers a substrate. Locations created earlier do not receive its
    /// creation callback.
    pub fn register_substrate(&self, substrate: Arc<dyn Substrate>) -> SubstrateId {
        self.dispatch.register(substrate)
    }

    pub fn set_recording(&self, recording: bool) {
        self.dispatch.set_recording(recording);
    }

    pub fn create_location(&self, kind: LocationKind) -> Location {
        let id = self.next_location.fetch_add(1, Ordering::Relaxed);
        let mut location = Location::new(id, kind);
        for callback in &self.dispatch.callbacks().location_creation {
            callback(&mut location);
        }
        debug!(location = id, ?kind, "Created location");
        location
    }

    pub fn finalize_location(&self, mut location: Location) {
        for callback in &self.dispatch.callbacks().location_finalize {
            callback(&mut location);
        }
        debug!(location = location.id(), "Finalized location");
    }

    #[inline]
    pub fn enter(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) {
        for callback in &self.dispatch.callbacks().enter {
            callback(location, timestamp, region, metrics);
        }
    }

    #[inline]
    pub fn exit(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) {
        for callback in &self.dispatch.callbacks().exit {
            callback(location, timestamp, region, metrics);
        }
    }

    #[inline]
    pub fn trigger_integer(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        metric: Handle<MetricDef>,
        value: u64,
    ) {
        for callback in &self.dispatch.callbacks().trigger_integer {
            callback(location, timestamp, metric, value);
        }
    }

    #[inline]
    pub fn trigger_double(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        metric: Handle<MetricDef>,
        value: f64,
    ) {
        for callback in &self.dispatch.callbacks().trigger_double {
            callback(location, timestamp, metric, value);
        }
    }

    #[inline]
    pub fn parameter_integer(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        parameter: Handle<ParameterDef>,
        value: i64,
    ) {
        for callback in &self.dispatch.callbacks().parameter_integer {
            callback(location, timestamp, parameter, value);
        }
    }

    #[inline]
    pub fn parameter_string(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        parameter: Handle<ParameterDef>,
        value: Handle<StringDef>,
    ) {
        for callback in &self.dispatch.callbacks().parameter_string {
            callback(location, timestamp, parameter, value);
        }
    }

    /// Starts a new task on `location` and returns its id.
    pub fn task_begin(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        region: Handle<RegionDef>,
        metrics: &[u64],
    ) -> TaskId {
        let task = location.new_task_id();
        for callback in &self.dispatch.callbacks().task_begin {
            callback(location, timestamp, region, task, metrics);
        }
        task
    }

    pub fn task_switch(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        task: TaskId,
        metrics: &[u64],
    ) {
        for callback in &self.dispatch.callbacks().task_switch {
            callback(location, timestamp, task, metrics);
        }
    }

    pub fn task_end(
        &self,
        location: &mut Location,
        timestamp: Timestamp,
        region: Handle<RegionDef>,
        task: TaskId,
        metrics: &[u64],
    ) {
        for callback in &self.dispatch.callbacks().task_end {
            callback(location, timestamp, region, task, metrics);
        }
    }

    /// Runs definition unification over `comm`. The coordinator receives
    /// the unified definitions. A failure is reported and returned; it
    /// leaves this process's definitions un-unified.
    pub fn unify<C: Collective + ?Sized>(
        &self,
        comm: &C,
    ) -> Result<Option<DefinitionManager>, MeasurementError> {
        unify(&self.definitions, comm).map_err(|e| {
            self.reporter
                .report("unification", FaultKind::Unification, &e);
            MeasurementError::Unify(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmeasure_definitions::collective::SingleProcess;
    use libmeasure_definitions::{NewRegion, Paradigm, RegionType};
    use parking_lot::Mutex;

    /// Records every event as a line of text.
    #[derive(Default)]
    struct Journal {
        lines: Mutex<Vec<String>>,
    }

    impl Substrate for Journal {
        fn name(&self) -> &'static str {
            "journal"
        }

        fn register(self: Arc<Self>, id: SubstrateId, callbacks: &mut EventCallbacks) {
            let this = self.clone();
            callbacks.location_creation.push(Arc::new(move |location| {
                location.set_substrate_data(id, 0u32);
                this.lines.lock().push(format!("create {}", location.id()));
            }));
            let this = self.clone();
            callbacks.enter.push(Arc::new(move |location, ts, region, _| {
                if let Some(depth) = location.substrate_data_mut::<u32>(id) {
                    *depth += 1;
                }
                this.lines.lock().push(format!("enter {} @{ts}", region.id()));
            }));
            let this = self.clone();
            callbacks.task_begin.push(Arc::new(move |_, ts, _, task, _| {
                this.lines.lock().push(format!("begin {task} @{ts}"));
            }));
            callbacks.location_finalize.push(Arc::new(move |location| {
                let depth = location.take_substrate_data::<u32>(id).unwrap_or_default();
                self.lines
                    .lock()
                    .push(format!("finalize {} depth {depth}", location.id()));
            }));
        }
    }

    fn small_config() -> MeasurementConfig {
        MeasurementConfig {
            total_memory: 1 << 20,
            page_size: 4096,
            ..MeasurementConfig::default()
        }
    }

    #[test]
    fn events_reach_substrates() {
        let context = MeasurementContext::new(small_config()).unwrap();
        let journal = Arc::new(Journal::default());
        context.register_substrate(journal.clone());

        let region = context
            .definitions()
            .define_region(NewRegion::new("main", Paradigm::User, RegionType::Function))
            .unwrap();
        let mut location = context.create_location(LocationKind::CpuThread);
        context.enter(&mut location, 5, region, &[]);
        let task = context.task_begin(&mut location, 6, region, &[]);
        context.set_recording(false);
        context.enter(&mut location, 7, region, &[]);
        context.finalize_location(location);

        assert_eq!(
            *journal.lines.lock(),
            vec![
                "create 0".to_string(),
                format!("enter {} @5", region.id()),
                format!("begin {task} @6"),
                "finalize 0 depth 1".to_string(),
            ]
        );
        assert_eq!(task, TaskId::new(0, 1));
    }

    #[test]
    fn locations_get_distinct_ids() {
        let context = MeasurementContext::new(small_config()).unwrap();
        let a = context.create_location(LocationKind::CpuThread);
        let b = context.create_location(LocationKind::GpuStream);
        assert_ne!(a.id(), b.id());
        assert_eq!(b.kind(), LocationKind::GpuStream);
    }

    #[test]
    fn invalid_arena_is_an_error() {
        let config = MeasurementConfig {
            total_memory: 1024,
            page_size: 4096,
            ..MeasurementConfig::default()
        };
        assert!(matches!(
            MeasurementContext::new(config),
            Err(MeasurementError::Arena { .. })
        ));
    }

    #[test]
    fn failed_unification_is_reported() {
        let context = MeasurementContext::new(small_config()).unwrap();
        context
            .definitions()
            .define_string("hello")
            .unwrap();
        assert!(context.unify(&SingleProcess).unwrap().is_some());
        assert!(context.definitions().is_unified());
        assert_eq!(context.reporter().reported(), 0);

        assert!(matches!(
            context.unify(&SingleProcess),
            Err(MeasurementError::Unify(_))
        ));
        assert_eq!(context.reporter().reported(), 1);
    }
}
