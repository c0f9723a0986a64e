// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::table::Tables;
use crate::*;
use libmeasure_alloc::{Allocator, PageManager};
use parking_lot::Mutex;
use tracing::{debug, error};

/// The definitions of one process (or the unified definitions of all).
///
/// Every `define_*` call either returns the handle of an existing,
/// structurally equal definition or appends a new one. Dedupe and insert
/// happen under one lock, so concurrent callers never create duplicates.
pub struct DefinitionManager {
    inner: Mutex<Inner>,
}

struct Inner {
    pages: PageManager,
    tables: Tables,
    unified: bool,
}

/// Arguments of [`DefinitionManager::define_region`].
#[derive(Clone, Copy, Debug)]
pub struct NewRegion<'a> {
    pub name: &'a str,
    /// Defaults to `name` when `None`.
    pub canonical_name: Option<&'a str>,
    pub description: &'a str,
    pub region_type: RegionType,
    pub file: Option<&'a str>,
    pub begin_line: u32,
    pub end_line: u32,
    pub paradigm: Paradigm,
}

impl<'a> NewRegion<'a> {
    pub fn new(name: &'a str, paradigm: Paradigm, region_type: RegionType) -> Self {
        Self {
            name,
            canonical_name: None,
            description: "",
            region_type,
            file: None,
            begin_line: 0,
            end_line: 0,
            paradigm,
        }
    }
}

/// Arguments of [`DefinitionManager::define_metric`].
#[derive(Clone, Copy, Debug)]
pub struct NewMetric<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub source_type: MetricSourceType,
    pub mode: MetricMode,
    pub value_type: MetricValueType,
    pub base: MetricBase,
    pub exponent: i64,
    pub unit: &'a str,
    pub profiling_type: MetricProfilingType,
}

/// Accepts a handle only if it is defined in `tables`.
struct Validate<'a>(&'a Tables);

impl HandleMapper for Validate<'_> {
    fn map<K: Definable>(&self, handle: Handle<K>) -> Result<Handle<K>, DefinitionError> {
        if K::table(self.0).contains(handle) {
            Ok(handle)
        } else {
            Err(DefinitionError::InvalidHandle {
                kind: K::KIND,
                id: handle.id(),
            })
        }
    }
}

impl DefinitionManager {
    pub fn new(allocator: &Allocator) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pages: allocator.create_page_manager(),
                tables: Tables::default(),
                unified: false,
            }),
        }
    }

    /// The arena this manager allocates from.
    pub fn allocator(&self) -> Allocator {
        self.inner.lock().pages.allocator().clone()
    }

    /// Adds `payload` unless an equal definition exists. Every handle in
    /// the payload must belong to this manager.
    pub fn define<T: Definable>(&self, payload: T) -> Result<Handle<T>, DefinitionError> {
        self.define_with_tail(payload, &[])
    }

    pub(crate) fn define_with_tail<T: Definable>(
        &self,
        payload: T,
        tail: &[u8],
    ) -> Result<Handle<T>, DefinitionError> {
        let mut inner = self.inner.lock();
        let Inner { pages, tables, .. } = &mut *inner;
        payload.remap(&Validate(tables))?;

        let table = T::table_mut(tables);
        if table.disabled {
            return Err(DefinitionError::Disabled(T::KIND));
        }
        match table.insert(pages, payload, tail) {
            Ok(handle) => Ok(handle),
            Err(_) => {
                table.disabled = true;
                error!(
                    kind = %T::KIND,
                    defined = table.len(),
                    "Definition memory exhausted, no further {} definitions will be recorded",
                    T::KIND
                );
                Err(DefinitionError::OutOfMemory(T::KIND))
            }
        }
    }

    pub fn define_string(&self, value: &str) -> Result<Handle<StringDef>, DefinitionError> {
        self.define_with_tail(StringDef, value.as_bytes())
    }

    pub fn define_source_file(&self, name: &str) -> Result<Handle<SourceFileDef>, DefinitionError> {
        let name = self.define_string(name)?;
        self.define(SourceFileDef { name })
    }

    pub fn define_region(
        &self,
        region: NewRegion<'_>,
    ) -> Result<Handle<RegionDef>, DefinitionError> {
        let name = self.define_string(region.name)?;
        let canonical_name = match region.canonical_name {
            Some(canonical) => self.define_string(canonical)?,
            None => name,
        };
        let description = self.define_string(region.description)?;
        let file = region
            .file
            .map(|file| self.define_source_file(file))
            .transpose()?;
        self.define(RegionDef {
            name,
            canonical_name,
            description,
            region_type: region.region_type,
            file,
            begin_line: region.begin_line,
            end_line: region.end_line,
            paradigm: region.paradigm,
        })
    }

    pub fn define_parameter(
        &self,
        name: &str,
        parameter_type: ParameterType,
    ) -> Result<Handle<ParameterDef>, DefinitionError> {
        let name = self.define_string(name)?;
        self.define(ParameterDef {
            name,
            parameter_type,
        })
    }

    pub fn define_metric(
        &self,
        metric: NewMetric<'_>,
    ) -> Result<Handle<MetricDef>, DefinitionError> {
        let name = self.define_string(metric.name)?;
        let description = self.define_string(metric.description)?;
        let unit = self.define_string(metric.unit)?;
        self.define(MetricDef {
            name,
            description,
            source_type: metric.source_type,
            mode: metric.mode,
            value_type: metric.value_type,
            base: metric.base,
            exponent: metric.exponent,
            unit,
            profiling_type: metric.profiling_type,
        })
    }

    pub fn define_group(
        &self,
        group_type: GroupType,
        name: &str,
        members: &[u64],
    ) -> Result<Handle<GroupDef>, DefinitionError> {
        let name = self.define_string(name)?;
        let tail: Vec<u8> = members.iter().flat_map(|m| m.to_le_bytes()).collect();
        self.define_with_tail(GroupDef { group_type, name }, &tail)
    }

    pub fn define_communicator(
        &self,
        name: &str,
        group: Handle<GroupDef>,
        parent: Option<Handle<CommunicatorDef>>,
    ) -> Result<Handle<CommunicatorDef>, DefinitionError> {
        let name = self.define_string(name)?;
        self.define(CommunicatorDef {
            name,
            group,
            parent,
        })
    }

    pub fn define_callpath(
        &self,
        parent: Option<Handle<CallpathDef>>,
        argument: CallpathArgument,
    ) -> Result<Handle<CallpathDef>, DefinitionError> {
        self.define(CallpathDef { parent, argument })
    }

    pub fn get<T: Definable>(&self, handle: Handle<T>) -> Option<T> {
        let inner = self.inner.lock();
        T::table(&inner.tables).payload(&inner.pages, handle)
    }

    pub fn string(&self, handle: Handle<StringDef>) -> Option<String> {
        let inner = self.inner.lock();
        let (_, bytes) = inner.tables.strings.record(&inner.pages, handle)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn group_members(&self, handle: Handle<GroupDef>) -> Option<Vec<u64>> {
        let inner = self.inner.lock();
        let (_, bytes) = inner.tables.groups.record(&inner.pages, handle)?;
        Some(
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    u64::from_le_bytes(word)
                })
                .collect(),
        )
    }

    /// Number of definitions of kind `T`.
    pub fn count<T: Definable>(&self) -> usize {
        T::table(&self.inner.lock().tables).len()
    }

    /// All handles of kind `T` in sequence order.
    pub fn handles<T: Definable>(&self) -> impl Iterator<Item = Handle<T>> {
        (0..self.count::<T>() as u32).map(Handle::new)
    }

    pub fn is_disabled<T: Definable>(&self) -> bool {
        T::table(&self.inner.lock().tables).disabled
    }

    pub fn is_unified(&self) -> bool {
        self.inner.lock().unified
    }

    /// The global handle of a local definition, once unification ran.
    pub fn unified_handle<T: Definable>(&self, handle: Handle<T>) -> Option<Handle<T>> {
        let inner = self.inner.lock();
        T::table(&inner.tables).unified(&inner.pages, handle)
    }

    /// Local sequence number to global sequence number, once unification
    /// ran.
    pub fn mapping<T: Definable>(&self) -> Option<Vec<u32>> {
        T::table(&self.inner.lock().tables).mapping.clone()
    }

    /// Every definition of kind `T` with its trailing data, in sequence
    /// order.
    pub(crate) fn export<T: Definable>(&self) -> Vec<(T, Vec<u8>)> {
        let inner = self.inner.lock();
        let table = T::table(&inner.tables);
        (0..table.len() as u32)
            .filter_map(|id| {
                table
                    .record(&inner.pages, Handle::new(id))
                    .map(|(payload, tail)| (payload, tail.to_vec()))
            })
            .collect()
    }

    /// Stores the unification result for every kind at once.
    pub(crate) fn apply_mappings(&self, mappings: Mappings) -> Result<(), UnifyError> {
        let mut inner = self.inner.lock();
        if inner.unified {
            return Err(UnifyError::AlreadyUnified);
        }
        let Inner { pages, tables, .. } = &mut *inner;
        let lens = tables.lens();
        let mut mappings = mappings.into_inner();
        for kind in DefinitionKind::UNIFY_ORDER {
            let got = mappings[kind.index()].as_ref().map_or(0, Vec::len);
            let expected = lens[kind.index()];
            if got != expected {
                return Err(UnifyError::MappingLength {
                    kind,
                    expected,
                    got,
                });
            }
        }
        let mut take = |kind: DefinitionKind| mappings[kind.index()].take().unwrap_or_default();
        let applied = tables.strings.set_unified(pages, take(DefinitionKind::String))
            && tables.source_files.set_unified(pages, take(DefinitionKind::SourceFile))
            && tables.regions.set_unified(pages, take(DefinitionKind::Region))
            && tables.parameters.set_unified(pages, take(DefinitionKind::Parameter))
            && tables.metrics.set_unified(pages, take(DefinitionKind::Metric))
            && tables.groups.set_unified(pages, take(DefinitionKind::Group))
            && tables.communicators.set_unified(pages, take(DefinitionKind::Communicator))
            && tables.callpaths.set_unified(pages, take(DefinitionKind::Callpath));
        if !applied {
            return Err(UnifyError::Inconsistent(
                "a local definition could not be resolved".into(),
            ));
        }
        inner.unified = true;
        debug!("Stored unified definition mappings");
        Ok(())
    }
}

impl core::fmt::Debug for DefinitionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        let tables = &inner.tables;
        f.debug_struct("DefinitionManager")
            .field("strings", &tables.strings.len())
            .field("regions", &tables.regions.len())
            .field("metrics", &tables.metrics.len())
            .field("callpaths", &tables.callpaths.len())
            .field("pages", &inner.pages.number_of_used_pages())
            .field("unified", &inner.unified)
            .finish()
    }
}
