// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_alloc::AllocError;
use libmeasure_definitions::{DefinitionError, Handle, RegionDef};
use libmeasure_measurement::{FaultKind, TaskId};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProfileError {
    #[error("profiling memory exhausted")]
    OutOfMemory,
    #[error("exit of {region:?} on location {location} without a matching enter")]
    ExitWithoutEnter {
        location: u32,
        region: Handle<RegionDef>,
    },
    #[error(
        "exit of {exited:?} on location {location} while {expected:?} is the innermost open region"
    )]
    ExitMismatch {
        location: u32,
        expected: Handle<RegionDef>,
        exited: Handle<RegionDef>,
    },
    #[error("unknown task {task} on location {location}")]
    UnknownTask { location: u32, task: TaskId },
    #[error("task {task} on location {location} is already open")]
    DuplicateTask { location: u32, task: TaskId },
    #[error("expected {expected} dense metric values, got {got}")]
    MetricCount { expected: usize, got: usize },
    #[error("call tree node {0} is missing")]
    MissingNode(u32),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

impl From<AllocError> for ProfileError {
    #[cold]
    fn from(_: AllocError) -> Self {
        ProfileError::OutOfMemory
    }
}

impl ProfileError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ProfileError::OutOfMemory
            | ProfileError::Definition(DefinitionError::OutOfMemory(_))
            | ProfileError::Definition(DefinitionError::Disabled(_)) => {
                FaultKind::ResourceExhausted
            }
            _ => FaultKind::Consistency,
        }
    }
}
