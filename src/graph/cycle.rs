//! Cycle detection over command dependencies.

use std::collections::BTreeSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::error::{CompileError, Result};

use super::{CommandGraph, CommandId, GeneratorSite};

/// Reject a command whose dependent computations were already produced by
/// the same host call site: the section would consume its own output.
pub(super) fn check_generator(
    graph: &CommandGraph,
    producers: &[CommandId],
    site: GeneratorSite,
    new_command: CommandId,
) -> Result<()> {
    let mut stack: Vec<CommandId> = producers.to_vec();
    let mut visited = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(command) = graph.command(id) else {
            continue;
        };
        if command.generator == Some(site) {
            return Err(CompileError::Cycle {
                command: new_command,
                site: Some(site),
            });
        }
        stack.extend(command.inputs.iter().map(|input| input.producer));
    }
    Ok(())
}

/// Every command reachable from `root`, producers before consumers.
///
/// A genuine cycle (only possible after rewiring) is a `CycleError` naming
/// one command on the cycle.
pub fn dependency_order(graph: &CommandGraph, root: CommandId) -> Result<Vec<CommandId>> {
    let mut deps: DiGraphMap<CommandId, ()> = DiGraphMap::new();
    let mut stack = vec![root];
    let mut visited = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let command = graph.get(id)?;
        deps.add_node(id);
        for input in &command.inputs {
            if graph.command(input.producer).is_none() {
                return Err(CompileError::internal(format!(
                    "command {} reads missing producer {}",
                    id, input.producer
                )));
            }
            deps.add_edge(input.producer, id, ());
            stack.push(input.producer);
        }
    }
    toposort(&deps, None).map_err(|cycle| {
        let command = cycle.node_id();
        CompileError::Cycle {
            command,
            site: graph.command(command).and_then(|c| c.generator),
        }
    })
}
