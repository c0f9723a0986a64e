// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merging the definition managers of all processes into one global
//! numbering.
//!
//! Kinds are processed in [`DefinitionKind::UNIFY_ORDER`]. For each kind
//! every rank sends its definitions to the coordinator with references to
//! earlier kinds already translated to global sequence numbers. The
//! coordinator inserts them rank by rank into the unified manager, which
//! dedupes exactly like a local define, and broadcasts the resulting
//! local-to-global tables. References within the same kind (a callpath's
//! parent) are translated by the coordinator, since the sender does not
//! know their global numbers yet.
//!
//! Encounter order at the coordinator is strict rank order, then local
//! sequence order, so repeated runs over the same input produce the same
//! numbering. Any failure is broadcast as an abort and every rank returns
//! an error without touching its local definitions.

use crate::collective::{Collective, CollectiveError, ReduceOp};
use crate::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Rank that builds the unified definitions.
pub const COORDINATOR: usize = 0;

#[derive(Debug, thiserror::Error)]
pub enum UnifyError {
    #[error("collective communication failed during unification: {0}")]
    Collective(#[from] CollectiveError),
    #[error("failed to decode a unification buffer: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("definitions were already unified")]
    AlreadyUnified,
    #[error("unification of {kind} definitions was aborted because of rank {rank}: {reason}")]
    Aborted {
        kind: DefinitionKind,
        rank: usize,
        reason: String,
    },
    #[error("received {got} {kind} mappings for {expected} local definitions")]
    MappingLength {
        kind: DefinitionKind,
        expected: usize,
        got: usize,
    },
    #[error("inconsistent unification state: {0}")]
    Inconsistent(String),
}

/// Local-to-global sequence numbers, per kind.
#[derive(Debug, Default)]
pub(crate) struct Mappings([Option<Vec<u32>>; DefinitionKind::COUNT]);

impl Mappings {
    fn set(&mut self, kind: DefinitionKind, mapping: Vec<u32>) {
        self.0[kind.index()] = Some(mapping);
    }

    fn lookup(&self, kind: DefinitionKind, id: u32) -> Option<u32> {
        self.0[kind.index()].as_ref()?.get(id as usize).copied()
    }

    pub(crate) fn into_inner(self) -> [Option<Vec<u32>>; DefinitionKind::COUNT] {
        self.0
    }
}

#[derive(Serialize, Deserialize)]
struct WireDefinition<T> {
    payload: T,
    tail: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
enum Contribution<T> {
    Definitions(Vec<WireDefinition<T>>),
    Failed(String),
}

#[derive(Serialize, Deserialize)]
enum Verdict {
    /// Indexed by rank, then by local sequence number.
    Mappings(Vec<Vec<u32>>),
    Abort { rank: usize, reason: String },
}

/// Sender side: references to already unified kinds become global.
struct ToGlobal<'a> {
    mappings: &'a Mappings,
    current: DefinitionKind,
}

impl HandleMapper for ToGlobal<'_> {
    fn map<K: Definable>(&self, handle: Handle<K>) -> Result<Handle<K>, DefinitionError> {
        if K::KIND == self.current {
            return Ok(handle);
        }
        self.mappings
            .lookup(K::KIND, handle.id())
            .map(Handle::new)
            .ok_or(DefinitionError::Unmapped {
                kind: K::KIND,
                id: handle.id(),
            })
    }
}

/// Coordinator side: references within the kind being unified, resolved
/// through what this rank's earlier definitions were mapped to.
struct SameKind<'a> {
    kind: DefinitionKind,
    resolved: &'a [u32],
}

impl HandleMapper for SameKind<'_> {
    fn map<K: Definable>(&self, handle: Handle<K>) -> Result<Handle<K>, DefinitionError> {
        if K::KIND != self.kind {
            return Ok(handle);
        }
        self.resolved
            .get(handle.id() as usize)
            .map(|global| Handle::new(*global))
            .ok_or(DefinitionError::ForwardReference {
                kind: K::KIND,
                id: handle.id(),
            })
    }
}

/// Unifies `local` with the definitions of every other rank of `comm`.
///
/// Must be called collectively by all ranks. On success every local
/// definition knows its global handle, and the coordinator additionally
/// receives the unified manager. Failures are not retried.
pub fn unify<C: Collective + ?Sized>(
    local: &DefinitionManager,
    comm: &C,
) -> Result<Option<DefinitionManager>, UnifyError> {
    let rank = comm.rank();

    // Agree up front, so no rank enters the per-kind rounds alone.
    let already = comm.reduce(u64::from(local.is_unified()), ReduceOp::Max, COORDINATOR)?;
    let mut flag = already.map(|v| v.to_le_bytes().to_vec()).unwrap_or_default();
    comm.broadcast(&mut flag, COORDINATOR)?;
    if flag.iter().any(|b| *b != 0) {
        warn!(rank, "Refusing to unify definitions a second time");
        return Err(UnifyError::AlreadyUnified);
    }

    info!(rank, size = comm.size(), "Unifying definitions");
    let unified = (rank == COORDINATOR).then(|| DefinitionManager::new(&local.allocator()));
    let mut mappings = Mappings::default();
    unify_kind::<StringDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<SourceFileDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<RegionDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<ParameterDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<MetricDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<GroupDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<CommunicatorDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    unify_kind::<CallpathDef, C>(local, comm, unified.as_ref(), &mut mappings)?;
    comm.barrier()?;

    local.apply_mappings(mappings)?;
    if let Some(unified) = &unified {
        info!(
            regions = unified.count::<RegionDef>(),
            callpaths = unified.count::<CallpathDef>(),
            "Unified definitions"
        );
    }
    Ok(unified)
}

fn unify_kind<T: Definable, C: Collective + ?Sized>(
    local: &DefinitionManager,
    comm: &C,
    unified: Option<&DefinitionManager>,
    mappings: &mut Mappings,
) -> Result<(), UnifyError> {
    let kind = T::KIND;
    let rank = comm.rank();

    let definitions = local.export::<T>();
    let expected = definitions.len();
    let mapper = ToGlobal {
        mappings,
        current: kind,
    };
    let contribution = definitions
        .into_iter()
        .map(|(payload, tail)| {
            Ok(WireDefinition {
                payload: payload.remap(&mapper)?,
                tail,
            })
        })
        .collect::<Result<Vec<_>, DefinitionError>>();
    let contribution = match contribution {
        Ok(definitions) => Contribution::Definitions(definitions),
        Err(err) => Contribution::Failed(err.to_string()),
    };
    let buffer = encode_contribution(&contribution);

    let gathered = comm.gather(&buffer, COORDINATOR)?;
    let mut reply = match gathered {
        Some(buffers) => {
            let verdict = match unified {
                Some(unified) => coordinate::<T>(unified, &buffers),
                None => Verdict::Abort {
                    rank,
                    reason: "coordinator has no unified manager".into(),
                },
            };
            rmp_serde::to_vec(&verdict)
                .or_else(|err| {
                    rmp_serde::to_vec(&Verdict::Abort {
                        rank,
                        reason: format!("cannot encode mappings: {err}"),
                    })
                })
                .unwrap_or_default()
        }
        None => Vec::new(),
    };
    comm.broadcast(&mut reply, COORDINATOR)?;

    match rmp_serde::from_slice::<Verdict>(&reply)? {
        Verdict::Abort { rank, reason } => Err(UnifyError::Aborted { kind, rank, reason }),
        Verdict::Mappings(mut per_rank) => {
            let mine = per_rank
                .get_mut(rank)
                .map(std::mem::take)
                .unwrap_or_default();
            if mine.len() != expected {
                return Err(UnifyError::MappingLength {
                    kind,
                    expected,
                    got: mine.len(),
                });
            }
            debug!(rank, %kind, definitions = expected, "Unified definition kind");
            mappings.set(kind, mine);
            Ok(())
        }
    }
}

/// Encoding failures travel to the coordinator as `Failed` with the
/// encoder's message.
fn encode_contribution<T: Serialize>(contribution: &Contribution<T>) -> Vec<u8> {
    rmp_serde::to_vec(contribution)
        .or_else(|err| rmp_serde::to_vec(&Contribution::<T>::Failed(err.to_string())))
        // An empty buffer cannot be decoded and makes the coordinator abort.
        .unwrap_or_default()
}

fn coordinate<T: Definable>(unified: &DefinitionManager, buffers: &[Vec<u8>]) -> Verdict {
    let mut per_rank = Vec::with_capacity(buffers.len());
    for (rank, buffer) in buffers.iter().enumerate() {
        let abort = |reason: String| Verdict::Abort { rank, reason };
        let definitions = match rmp_serde::from_slice::<Contribution<T>>(buffer) {
            Ok(Contribution::Definitions(definitions)) => definitions,
            Ok(Contribution::Failed(reason)) => return abort(reason),
            Err(err) => return abort(err.to_string()),
        };

        let mut resolved = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let mapper = SameKind {
                kind: T::KIND,
                resolved: &resolved,
            };
            let handle = definition
                .payload
                .remap(&mapper)
                .and_then(|payload| unified.define_with_tail(payload, &definition.tail));
            match handle {
                Ok(handle) => resolved.push(handle.id()),
                Err(err) => return abort(err.to_string()),
            }
        }
        per_rank.push(resolved);
    }
    Verdict::Mappings(per_rank)
}
