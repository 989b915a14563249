use crate::error::ValidationError;
use crate::flow::{FlowGraph, InputAssignment};
use std::collections::{BTreeMap, BTreeSet};

/// Validate a flow graph and return a copy with nodes in a deterministic
/// dependency-respecting order.
///
/// Checks, in order: duplicate node names, dangling flow-input and node
/// references, aggregation boundary violations, cycles among the
/// dependency edges (activate guards count as edges), and output
/// references. The ordering is produced by Kahn's algorithm with a
/// first-eligible-in-declaration-order tie-break, so validating an
/// already-validated graph returns an equal ordering.
pub fn validate(graph: FlowGraph) -> Result<FlowGraph, ValidationError> {
    ensure_unique_node_names(&graph)?;
    ensure_references_resolve(&graph)?;
    ensure_aggregation_boundary(&graph)?;
    let mut graph = reorder_nodes(graph)?;
    graph.outputs = validated_outputs(&graph)?;
    Ok(graph)
}

fn ensure_unique_node_names(graph: &FlowGraph) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(ValidationError::DuplicateNode {
                node: node.name.clone(),
            });
        }
    }
    Ok(())
}

fn ensure_references_resolve(graph: &FlowGraph) -> Result<(), ValidationError> {
    let node_names: BTreeSet<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
    for node in &graph.nodes {
        let mut assignments: Vec<&InputAssignment> = node.inputs.values().collect();
        if let Some(activate) = &node.activate {
            assignments.push(&activate.condition);
        }
        for assignment in assignments {
            match assignment {
                InputAssignment::FlowInput { name } if !graph.inputs.contains_key(name) => {
                    return Err(ValidationError::DanglingReference {
                        context: format!("node '{}'", node.name),
                        reference: format!("flow input '{name}'"),
                    });
                }
                InputAssignment::NodeReference { node: target, .. }
                    if !node_names.contains(target.as_str()) =>
                {
                    return Err(ValidationError::DanglingReference {
                        context: format!("node '{}'", node.name),
                        reference: format!("node '{target}'"),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn ensure_aggregation_boundary(graph: &FlowGraph) -> Result<(), ValidationError> {
    let aggregation: BTreeSet<&str> = graph.aggregation_node_names();
    for node in &graph.nodes {
        if node.aggregation {
            // An aggregation node's guard may only reference other
            // aggregation nodes; data edges to line nodes are how the
            // across-row lists arrive and are allowed.
            if let Some(activate) = &node.activate {
                if let Some(target) = activate.condition.referenced_node() {
                    if !aggregation.contains(target) {
                        return Err(ValidationError::InvalidAggregationReference {
                            node: node.name.clone(),
                            reference: target.to_string(),
                        });
                    }
                }
            }
        } else {
            for dep in node.dependencies() {
                if aggregation.contains(dep) {
                    return Err(ValidationError::InvalidAggregationReference {
                        node: node.name.clone(),
                        reference: dep.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over the dependency map, always picking the first
/// eligible node in declaration order. Any unplaceable remainder is the
/// cycle, reported sorted.
fn reorder_nodes(graph: FlowGraph) -> Result<FlowGraph, ValidationError> {
    let dependencies: BTreeMap<&str, BTreeSet<&str>> = graph
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), n.dependencies()))
        .collect();

    let mut picked: BTreeSet<&str> = BTreeSet::new();
    let mut order: Vec<usize> = Vec::with_capacity(graph.nodes.len());
    for _ in 0..graph.nodes.len() {
        let next = graph.nodes.iter().position(|n| {
            !picked.contains(n.name.as_str())
                && dependencies[n.name.as_str()]
                    .iter()
                    .all(|d| picked.contains(d))
        });
        match next {
            Some(idx) => {
                picked.insert(graph.nodes[idx].name.as_str());
                order.push(idx);
            }
            None => {
                let remaining: Vec<String> = graph
                    .nodes
                    .iter()
                    .filter(|n| !picked.contains(n.name.as_str()))
                    .map(|n| n.name.clone())
                    .collect();
                let mut nodes = remaining;
                nodes.sort();
                return Err(ValidationError::CircularDependency { nodes });
            }
        }
    }

    let mut graph = graph;
    let mut sorted = Vec::with_capacity(order.len());
    let mut nodes: Vec<Option<_>> = graph.nodes.drain(..).map(Some).collect();
    for idx in order {
        sorted.push(nodes[idx].take().expect("node picked twice"));
    }
    graph.nodes = sorted;
    Ok(graph)
}

/// Outputs must resolve to a literal, a declared input, or an existing
/// node. An output referencing an aggregation node is dropped with a
/// warning rather than failing: aggregation results are batch-scoped and
/// cannot appear on a per-row output.
fn validated_outputs(
    graph: &FlowGraph,
) -> Result<BTreeMap<String, crate::flow::FlowOutput>, ValidationError> {
    let mut outputs = BTreeMap::new();
    for (name, output) in &graph.outputs {
        match &output.reference {
            InputAssignment::Literal { .. } => {}
            InputAssignment::FlowInput { name: input } => {
                if !graph.inputs.contains_key(input) {
                    return Err(ValidationError::DanglingReference {
                        context: format!("output '{name}'"),
                        reference: format!("flow input '{input}'"),
                    });
                }
            }
            InputAssignment::NodeReference { node, .. } => match graph.get_node(node) {
                None => {
                    return Err(ValidationError::DanglingReference {
                        context: format!("output '{name}'"),
                        reference: format!("node '{node}'"),
                    });
                }
                Some(target) if target.aggregation => {
                    tracing::warn!(
                        output = %name,
                        node = %node,
                        "output references an aggregation node and will not take effect"
                    );
                    continue;
                }
                Some(_) => {}
            },
        }
        outputs.insert(name.clone(), output.clone());
    }
    Ok(outputs)
}
