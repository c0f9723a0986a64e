// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{Location, TaskId, Timestamp};
use arc_swap::{ArcSwap, Guard};
use libmeasure_definitions::{Handle, MetricDef, ParameterDef, RegionDef, StringDef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Slot of a registered substrate, also the index of its per-location
/// data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubstrateId(usize);

impl SubstrateId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

pub type LocationCallback = Arc<dyn Fn(&mut Location) + Send + Sync>;
pub type RegionCallback =
    Arc<dyn Fn(&mut Location, Timestamp, Handle<RegionDef>, &[u64]) + Send + Sync>;
pub type TriggerCallback<V> =
    Arc<dyn Fn(&mut Location, Timestamp, Handle<MetricDef>, V) + Send + Sync>;
pub type ParameterCallback<V> =
    Arc<dyn Fn(&mut Location, Timestamp, Handle<ParameterDef>, V) + Send + Sync>;
pub type TaskRegionCallback =
    Arc<dyn Fn(&mut Location, Timestamp, Handle<RegionDef>, TaskId, &[u64]) + Send + Sync>;
pub type TaskSwitchCallback = Arc<dyn Fn(&mut Location, Timestamp, TaskId, &[u64]) + Send + Sync>;

/// Every callback currently registered, per event. Event sites call each
/// entry of their list without checking whether a substrate is active.
#[derive(Clone, Default)]
pub struct EventCallbacks {
    pub location_creation: Vec<LocationCallback>,
    pub location_finalize: Vec<LocationCallback>,
    pub enter: Vec<RegionCallback>,
    pub exit: Vec<RegionCallback>,
    pub trigger_integer: Vec<TriggerCallback<u64>>,
    pub trigger_double: Vec<TriggerCallback<f64>>,
    pub parameter_integer: Vec<ParameterCallback<i64>>,
    pub parameter_string: Vec<ParameterCallback<Handle<StringDef>>>,
    pub task_begin: Vec<TaskRegionCallback>,
    pub task_switch: Vec<TaskSwitchCallback>,
    pub task_end: Vec<TaskRegionCallback>,
}

impl EventCallbacks {
    /// Drops the event callbacks and keeps the location lifecycle ones.
    fn lifecycle_only(self) -> Self {
        Self {
            location_creation: self.location_creation,
            location_finalize: self.location_finalize,
            ..Self::default()
        }
    }

    fn event_count(&self) -> usize {
        self.enter.len()
            + self.exit.len()
            + self.trigger_integer.len()
            + self.trigger_double.len()
            + self.parameter_integer.len()
            + self.parameter_string.len()
            + self.task_begin.len()
            + self.task_switch.len()
            + self.task_end.len()
    }
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("location_creation", &self.location_creation.len())
            .field("location_finalize", &self.location_finalize.len())
            .field("events", &self.event_count())
            .finish()
    }
}

/// A recorder of measurement events, such as the profiler.
pub trait Substrate: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Adds this substrate's callbacks. Called again every time the table
    /// is rebuilt, so it must not have side effects beyond `callbacks`.
    fn register(self: Arc<Self>, id: SubstrateId, callbacks: &mut EventCallbacks);
}

/// The table of callbacks consulted by every event site.
pub struct SubstrateDispatch {
    substrates: Mutex<Registry>,
    active: ArcSwap<EventCallbacks>,
}

struct Registry {
    substrates: Vec<Arc<dyn Substrate>>,
    recording: bool,
}

impl Default for SubstrateDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstrateDispatch {
    pub fn new() -> Self {
        Self {
            substrates: Mutex::new(Registry {
                substrates: Vec::new(),
                recording: true,
            }),
            active: ArcSwap::from_pointee(EventCallbacks::default()),
        }
    }

    pub fn register(&self, substrate: Arc<dyn Substrate>) -> SubstrateId {
        let mut registry = self.substrates.lock();
        let id = SubstrateId(registry.substrates.len());
        debug!(substrate = substrate.name(), id = id.0, "Registering substrate");
        registry.substrates.push(substrate);
        self.rebuild(&registry);
        id
    }

    /// Switches event recording on or off. Location lifecycle callbacks stay
    /// registered either way.
    pub fn set_recording(&self, recording: bool) {
        let mut registry = self.substrates.lock();
        if registry.recording != recording {
            registry.recording = recording;
            self.rebuild(&registry);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.substrates.lock().recording
    }

    pub fn substrate_count(&self) -> usize {
        self.substrates.lock().substrates.len()
    }

    /// The current table. Cheap enough for every event.
    #[inline]
    pub fn callbacks(&self) -> Guard<Arc<EventCallbacks>> {
        self.active.load()
    }

    fn rebuild(&self, registry: &Registry) {
        let mut callbacks = EventCallbacks::default();
        for (index, substrate) in registry.substrates.iter().enumerate() {
            substrate.clone().register(SubstrateId(index), &mut callbacks);
        }
        if !registry.recording {
            callbacks = callbacks.lifecycle_only();
        }
        debug!(
            recording = registry.recording,
            events = callbacks.event_count(),
            "Rebuilt substrate callback table"
        );
        self.active.store(Arc::new(callbacks));
    }
}

impl fmt::Debug for SubstrateDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstrateDispatch")
            .field("callbacks", &**self.active.load())
            .finish_non_exhaustive()
    }
}
