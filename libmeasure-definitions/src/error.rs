// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::DefinitionKind;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("out of memory while adding a {0} definition, {0} definitions are now disabled")]
    OutOfMemory(DefinitionKind),
    #[error("{0} definitions are disabled")]
    Disabled(DefinitionKind),
    #[error("{kind} handle {id} does not belong to this definition manager")]
    InvalidHandle { kind: DefinitionKind, id: u32 },
    #[error("{kind} handle {id} has no unified counterpart")]
    Unmapped { kind: DefinitionKind, id: u32 },
    #[error("{kind} definition refers to {kind} {id}, which is not defined before it")]
    ForwardReference { kind: DefinitionKind, id: u32 },
}
