// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{NodeKind, ProfileError, ProfileLocation};
use libmeasure_alloc::ObjectId;
use libmeasure_definitions::{
    CallpathArgument, CallpathDef, DefinitionManager, Handle, NewRegion, Paradigm, ParameterValue,
    RegionDef, RegionType,
};

/// Regions standing in for nodes that have no region of their own.
pub const COLLAPSE_REGION: &str = "COLLAPSE";
pub const TASKS_REGION: &str = "TASKS";

/// Defines a callpath for every node reachable from the root of `location`
/// and stores it in [`ProfileNode::callpath`](crate::ProfileNode). Nodes of
/// tasks still running are skipped. Returns the number of nodes visited.
pub fn assign_callpaths(
    definitions: &DefinitionManager,
    location: &mut ProfileLocation,
) -> Result<usize, ProfileError> {
    let mut artificial = ArtificialRegions::default();
    let mut visited = 0;
    let root = location.root;
    let mut work: Vec<(ObjectId, Option<Handle<CallpathDef>>)> = location
        .tree
        .children(root)
        .map(|child| (child, None))
        .collect();
    work.reverse();

    while let Some((id, parent)) = work.pop() {
        let kind = location.tree.get(id)?.kind;
        let argument = match kind {
            NodeKind::Region(region) | NodeKind::TaskRoot(region) => {
                CallpathArgument::Region(region)
            }
            NodeKind::ParameterInteger { parameter, value } => CallpathArgument::Parameter {
                parameter,
                value: ParameterValue::Integer(value),
            },
            NodeKind::ParameterString { parameter, value } => CallpathArgument::Parameter {
                parameter,
                value: ParameterValue::String(value),
            },
            NodeKind::Collapse { .. } => {
                CallpathArgument::Region(artificial.collapse(definitions)?)
            }
            NodeKind::Tasks => CallpathArgument::Region(artificial.tasks(definitions)?),
            // Only the root is a thread root and it is never on the list.
            NodeKind::ThreadRoot => continue,
        };
        let callpath = definitions.define_callpath(parent, argument)?;
        location.tree.get_mut(id)?.callpath = Some(callpath);
        visited += 1;

        let first = work.len();
        work.extend(
            location
                .tree
                .children(id)
                .map(|child| (child, Some(callpath))),
        );
        work[first..].reverse();
    }
    Ok(visited)
}

#[derive(Default)]
struct ArtificialRegions {
    collapse: Option<Handle<RegionDef>>,
    tasks: Option<Handle<RegionDef>>,
}

impl ArtificialRegions {
    fn collapse(
        &mut self,
        definitions: &DefinitionManager,
    ) -> Result<Handle<RegionDef>, ProfileError> {
        Self::region(&mut self.collapse, definitions, COLLAPSE_REGION)
    }

    fn tasks(
        &mut self,
        definitions: &DefinitionManager,
    ) -> Result<Handle<RegionDef>, ProfileError> {
        Self::region(&mut self.tasks, definitions, TASKS_REGION)
    }

    fn region(
        slot: &mut Option<Handle<RegionDef>>,
        definitions: &DefinitionManager,
        name: &str,
    ) -> Result<Handle<RegionDef>, ProfileError> {
        if let Some(region) = *slot {
            return Ok(region);
        }
        let region = definitions.define_region(NewRegion::new(
            name,
            Paradigm::Measurement,
            RegionType::Artificial,
        ))?;
        *slot = Some(region);
        Ok(region)
    }
}
