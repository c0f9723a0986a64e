// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The definition kinds and their payloads.
//!
//! A payload holds only fixed-size fields; variable-length data (string
//! bytes, group members) is stored right after it in the record. Payloads
//! reference other definitions through [`Handle`]s of the same manager.

use crate::table::{KindTable, Tables};
use crate::{DefinitionError, Handle};
use core::fmt;
use core::hash::Hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DefinitionKind {
    String,
    SourceFile,
    Region,
    Parameter,
    Metric,
    Group,
    Communicator,
    Callpath,
}

impl DefinitionKind {
    pub const COUNT: usize = 8;

    /// Referenced kinds come before the kinds referencing them.
    pub const UNIFY_ORDER: [DefinitionKind; Self::COUNT] = [
        DefinitionKind::String,
        DefinitionKind::SourceFile,
        DefinitionKind::Region,
        DefinitionKind::Parameter,
        DefinitionKind::Metric,
        DefinitionKind::Group,
        DefinitionKind::Communicator,
        DefinitionKind::Callpath,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            DefinitionKind::String => "string",
            DefinitionKind::SourceFile => "source file",
            DefinitionKind::Region => "region",
            DefinitionKind::Parameter => "parameter",
            DefinitionKind::Metric => "metric",
            DefinitionKind::Group => "group",
            DefinitionKind::Communicator => "communicator",
            DefinitionKind::Callpath => "callpath",
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rewrites handles while a definition moves between managers.
pub trait HandleMapper {
    fn map<K: Definable>(&self, handle: Handle<K>) -> Result<Handle<K>, DefinitionError>;
}

/// Implemented by every definition payload.
pub trait Definable:
    Copy + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: DefinitionKind;

    #[doc(hidden)]
    fn table(tables: &Tables) -> &KindTable<Self>;

    #[doc(hidden)]
    fn table_mut(tables: &mut Tables) -> &mut KindTable<Self>;

    /// Returns a copy with every contained handle passed through `mapper`.
    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError>;
}

macro_rules! kind_table {
    ($field:ident) => {
        fn table(tables: &Tables) -> &KindTable<Self> {
            &tables.$field
        }

        fn table_mut(tables: &mut Tables) -> &mut KindTable<Self> {
            &mut tables.$field
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionType {
    Unknown,
    Function,
    Loop,
    User,
    Code,
    Phase,
    Dynamic,
    Barrier,
    Parallel,
    Task,
    TaskCreate,
    Wrapper,
    Artificial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Paradigm {
    Measurement,
    User,
    Compiler,
    Mpi,
    OpenMp,
    Pthread,
    Cuda,
    Hip,
    Kokkos,
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    Int64,
    Uint64,
    String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricSourceType {
    Papi,
    Rusage,
    User,
    Task,
    Plugin,
    Other,
}

/// How consecutive samples of a metric relate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricMode {
    /// Monotonic counter, read at start and end of an interval.
    AccumulatedStart,
    AccumulatedPoint,
    AccumulatedLast,
    /// Each sample is a value in its own right.
    AbsolutePoint,
    AbsoluteLast,
    RelativePoint,
    RelativeLast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricValueType {
    Int64,
    Uint64,
    Double,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricBase {
    Binary,
    Decimal,
}

/// How the profile aggregates a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricProfilingType {
    Exclusive,
    Inclusive,
    Simple,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    Locations,
    Regions,
    Metrics,
    CommLocations,
    CommGroup,
    CommSelf,
}

/// A string. The bytes follow the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringDef;

impl Definable for StringDef {
    const KIND: DefinitionKind = DefinitionKind::String;
    kind_table!(strings);

    fn remap<M: HandleMapper>(&self, _mapper: &M) -> Result<Self, DefinitionError> {
        Ok(*self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFileDef {
    pub name: Handle<StringDef>,
}

impl Definable for SourceFileDef {
    const KIND: DefinitionKind = DefinitionKind::SourceFile;
    kind_table!(source_files);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionDef {
    pub name: Handle<StringDef>,
    pub canonical_name: Handle<StringDef>,
    pub description: Handle<StringDef>,
    pub region_type: RegionType,
    pub file: Option<Handle<SourceFileDef>>,
    pub begin_line: u32,
    pub end_line: u32,
    pub paradigm: Paradigm,
}

impl Definable for RegionDef {
    const KIND: DefinitionKind = DefinitionKind::Region;
    kind_table!(regions);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
            canonical_name: mapper.map(self.canonical_name)?,
            description: mapper.map(self.description)?,
            file: self.file.map(|file| mapper.map(file)).transpose()?,
            ..*self
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: Handle<StringDef>,
    pub parameter_type: ParameterType,
}

impl Definable for ParameterDef {
    const KIND: DefinitionKind = DefinitionKind::Parameter;
    kind_table!(parameters);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
            ..*self
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDef {
    pub name: Handle<StringDef>,
    pub description: Handle<StringDef>,
    pub source_type: MetricSourceType,
    pub mode: MetricMode,
    pub value_type: MetricValueType,
    pub base: MetricBase,
    pub exponent: i64,
    pub unit: Handle<StringDef>,
    pub profiling_type: MetricProfilingType,
}

impl Definable for MetricDef {
    const KIND: DefinitionKind = DefinitionKind::Metric;
    kind_table!(metrics);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
            description: mapper.map(self.description)?,
            unit: mapper.map(self.unit)?,
            ..*self
        })
    }
}

/// A group of locations, regions or metrics. The members follow the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupDef {
    pub group_type: GroupType,
    pub name: Handle<StringDef>,
}

impl Definable for GroupDef {
    const KIND: DefinitionKind = DefinitionKind::Group;
    kind_table!(groups);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
            ..*self
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommunicatorDef {
    pub name: Handle<StringDef>,
    pub group: Handle<GroupDef>,
    pub parent: Option<Handle<CommunicatorDef>>,
}

impl Definable for CommunicatorDef {
    const KIND: DefinitionKind = DefinitionKind::Communicator;
    kind_table!(communicators);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        Ok(Self {
            name: mapper.map(self.name)?,
            group: mapper.map(self.group)?,
            parent: self.parent.map(|parent| mapper.map(parent)).transpose()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterValue {
    Integer(i64),
    String(Handle<StringDef>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallpathArgument {
    Region(Handle<RegionDef>),
    Parameter {
        parameter: Handle<ParameterDef>,
        value: ParameterValue,
    },
}

/// One frame of a calling context: its parent frame and what was entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallpathDef {
    pub parent: Option<Handle<CallpathDef>>,
    pub argument: CallpathArgument,
}

impl Definable for CallpathDef {
    const KIND: DefinitionKind = DefinitionKind::Callpath;
    kind_table!(callpaths);

    fn remap<M: HandleMapper>(&self, mapper: &M) -> Result<Self, DefinitionError> {
        let argument = match self.argument {
            CallpathArgument::Region(region) => CallpathArgument::Region(mapper.map(region)?),
            CallpathArgument::Parameter { parameter, value } => CallpathArgument::Parameter {
                parameter: mapper.map(parameter)?,
                value: match value {
                    ParameterValue::Integer(value) => ParameterValue::Integer(value),
                    ParameterValue::String(value) => ParameterValue::String(mapper.map(value)?),
                },
            },
        };
        Ok(Self {
            parent: self.parent.map(|parent| mapper.map(parent)).transpose()?,
            argument,
        })
    }
}
