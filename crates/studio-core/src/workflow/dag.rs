//! DAG utilities: cycle detection and descendant closure.
//!
//! Uses `petgraph` to model `deps` edges as a directed graph. Topological
//! sort detects cycles at validation time; the descendant closure drives
//! branch skipping (a non-chosen branch and everything downstream of it is
//! marked skipped).

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use studio_types::workflow::WorkflowStep;

use super::definition::WorkflowError;

/// Verify that the steps form a valid DAG (no cycles, all deps exist).
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.deps {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok(())
}

/// Dependents adjacency: step id -> ids that list it in `deps`.
pub fn dependents_index(steps: &[WorkflowStep]) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for step in steps {
        for dep in &step.deps {
            index.entry(dep.clone()).or_default().push(step.id.clone());
        }
    }
    index
}

/// The given step plus every transitive dependent of it.
///
/// Used to skip a non-chosen conditional branch along with everything that
/// can only run downstream of it.
pub fn descendants_including(
    step_id: &str,
    dependents: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut stack = vec![step_id.to_string()];

    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(children) = dependents.get(&current) {
            for child in children {
                stack.push(child.clone());
            }
        }
    }

    let mut result: Vec<String> = visited.into_iter().collect();
    result.sort();
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
