// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_alloc::Allocator;
use libmeasure_definitions::collective::{thread_group, SingleProcess, ThreadRank, DEFAULT_TIMEOUT};
use libmeasure_definitions::*;
use std::thread;

struct Rank {
    local: DefinitionManager,
    result: Result<Option<DefinitionManager>, UnifyError>,
}

fn new_manager() -> DefinitionManager {
    DefinitionManager::new(&Allocator::new(4 << 20, 8192).unwrap())
}

/// Builds one manager per rank with `build`, then unifies them on threads.
fn run(size: usize, build: impl Fn(usize, &DefinitionManager) + Sync) -> Vec<Rank> {
    let group = thread_group(size, DEFAULT_TIMEOUT);
    let build = &build;
    thread::scope(|scope| {
        let workers: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                scope.spawn(move || {
                    let local = new_manager();
                    build(rank, &local);
                    let result = unify(&local, &comm);
                    Rank { local, result }
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    })
}

fn program(rank: usize, defs: &DefinitionManager) {
    let region = |name: &str| {
        defs.define_region(NewRegion {
            file: Some("solver.c"),
            ..NewRegion::new(name, Paradigm::User, RegionType::Function)
        })
        .unwrap()
    };
    // Every rank shares main and solve but defines them in different orders
    // and adds a region of its own.
    let (main, solve) = if rank % 2 == 0 {
        let main = region("main");
        (main, region("solve"))
    } else {
        let solve = region("solve");
        (region("main"), solve)
    };
    let own = region(&format!("rank_{rank}_only"));
    let iteration = defs.define_parameter("iteration", ParameterType::Int64).unwrap();

    let root = defs.define_callpath(None, CallpathArgument::Region(main)).unwrap();
    let solve_path = defs
        .define_callpath(Some(root), CallpathArgument::Region(solve))
        .unwrap();
    defs.define_callpath(
        Some(solve_path),
        CallpathArgument::Parameter {
            parameter: iteration,
            value: ParameterValue::Integer(rank as i64 % 2),
        },
    )
    .unwrap();
    defs.define_callpath(Some(root), CallpathArgument::Region(own))
        .unwrap();

    defs.define_metric(NewMetric {
        name: "PAPI_TOT_CYC",
        description: "total cycles",
        source_type: MetricSourceType::Papi,
        mode: MetricMode::AccumulatedStart,
        value_type: MetricValueType::Uint64,
        base: MetricBase::Decimal,
        exponent: 0,
        unit: "#",
        profiling_type: MetricProfilingType::Exclusive,
    })
    .unwrap();
    let world = defs
        .define_group(GroupType::CommLocations, "world", &[0, 1, 2, 3])
        .unwrap();
    defs.define_communicator("MPI_COMM_WORLD", world, None).unwrap();
}

fn region_name(defs: &DefinitionManager, region: Handle<RegionDef>) -> String {
    defs.string(defs.get(region).unwrap().name).unwrap()
}

/// Renders a callpath as "main/solve/iteration=1".
fn callpath_text(defs: &DefinitionManager, mut callpath: Handle<CallpathDef>) -> String {
    let mut frames = Vec::new();
    loop {
        let def = defs.get(callpath).unwrap();
        frames.push(match def.argument {
            CallpathArgument::Region(region) => region_name(defs, region),
            CallpathArgument::Parameter { parameter, value } => {
                let name = defs.string(defs.get(parameter).unwrap().name).unwrap();
                match value {
                    ParameterValue::Integer(v) => format!("{name}={v}"),
                    ParameterValue::String(s) => format!("{name}={}", defs.string(s).unwrap()),
                }
            }
        });
        match def.parent {
            Some(parent) => callpath = parent,
            None => break,
        }
    }
    frames.reverse();
    frames.join("/")
}

#[test]
fn shared_definitions_map_to_one_global_handle() {
    let ranks = run(4, program);
    let unified = ranks[0].result.as_ref().unwrap().as_ref().unwrap();
    for rank in &ranks[1..] {
        assert!(rank.result.as_ref().unwrap().is_none());
    }

    // main, solve and four rank-specific regions.
    assert_eq!(unified.count::<RegionDef>(), 6);
    // main, main/solve, two iteration values, four rank-specific leaves.
    assert_eq!(unified.count::<CallpathDef>(), 8);
    assert_eq!(unified.count::<MetricDef>(), 1);
    assert_eq!(unified.count::<CommunicatorDef>(), 1);

    for rank in &ranks {
        assert!(rank.local.is_unified());
        for region in rank.local.handles::<RegionDef>() {
            let global = rank.local.unified_handle(region).unwrap();
            assert_eq!(region_name(&rank.local, region), region_name(unified, global));
        }
        for callpath in rank.local.handles::<CallpathDef>() {
            let global = rank.local.unified_handle(callpath).unwrap();
            assert_eq!(
                callpath_text(&rank.local, callpath),
                callpath_text(unified, global)
            );
        }
        for string in rank.local.handles::<StringDef>() {
            let global = rank.local.unified_handle(string).unwrap();
            assert_eq!(rank.local.string(string), unified.string(global));
        }
        let groups = rank.local.mapping::<GroupDef>().unwrap();
        assert_eq!(groups, vec![0]);
    }

    // Equal structure, equal global handle, across ranks.
    let main_of = |rank: &Rank| {
        rank.local
            .handles::<RegionDef>()
            .find(|r| region_name(&rank.local, *r) == "main")
            .and_then(|r| rank.local.unified_handle(r))
            .unwrap()
    };
    let main = main_of(&ranks[0]);
    assert!(ranks.iter().all(|rank| main_of(rank) == main));
}

#[test]
fn distinct_definitions_stay_distinct() {
    let ranks = run(3, program);
    let mut globals: Vec<_> = ranks
        .iter()
        .flat_map(|rank| {
            rank.local
                .handles::<RegionDef>()
                .filter(|r| region_name(&rank.local, *r).starts_with("rank_"))
                .map(|r| rank.local.unified_handle(r).unwrap())
                .collect::<Vec<_>>()
        })
        .collect();
    globals.sort();
    globals.dedup();
    assert_eq!(globals.len(), 3);
}

#[test]
fn numbering_is_deterministic() {
    let mappings = |ranks: &[Rank]| {
        ranks
            .iter()
            .map(|rank| {
                (
                    rank.local.mapping::<StringDef>().unwrap(),
                    rank.local.mapping::<RegionDef>().unwrap(),
                    rank.local.mapping::<CallpathDef>().unwrap(),
                )
            })
            .collect::<Vec<_>>()
    };
    let first = run(5, program);
    let second = run(5, program);
    assert_eq!(mappings(&first), mappings(&second));

    // Rank 0's definitions come first in the global numbering.
    let (strings, _, _) = &mappings(&first)[0];
    assert_eq!(strings, &(0..strings.len() as u32).collect::<Vec<_>>());
}

#[test]
fn failed_peer_aborts_every_rank() {
    let group = thread_group(3, DEFAULT_TIMEOUT);
    let results: Vec<(bool, Result<_, UnifyError>)> = thread::scope(|scope| {
        let workers: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm): (usize, ThreadRank)| {
                scope.spawn(move || {
                    let local = new_manager();
                    program(rank, &local);
                    if rank == 2 {
                        comm.abort();
                    }
                    let result = unify(&local, &comm).map(|unified| unified.is_some());
                    (local.is_unified(), result)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    for (is_unified, result) in results {
        assert!(!is_unified);
        assert!(matches!(
            result,
            Err(UnifyError::Collective(collective::CollectiveError::PeerAborted(2)))
        ));
    }
}

#[test]
fn unifying_twice_is_refused() {
    let local = new_manager();
    program(0, &local);
    let unified = unify(&local, &SingleProcess).unwrap().unwrap();
    assert_eq!(unified.count::<RegionDef>(), local.count::<RegionDef>());
    let before = local.mapping::<RegionDef>();
    assert!(matches!(
        unify(&local, &SingleProcess),
        Err(UnifyError::AlreadyUnified)
    ));
    assert_eq!(local.mapping::<RegionDef>(), before);
}

#[test]
fn single_process_mapping_is_identity() {
    let local = new_manager();
    program(1, &local);
    unify(&local, &SingleProcess).unwrap();
    for handle in local.handles::<CallpathDef>() {
        assert_eq!(local.unified_handle(handle), Some(handle));
    }
}
