use flowcore::{InputAssignment, Node, NodeError, Value};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tracks readiness, bypassing and completion for one pass over a node
/// subset (the line nodes of one row, or the aggregation nodes of one
/// batch).
///
/// Dependencies that are not part of the subset must be satisfied
/// through `preset_outputs` (how aggregation nodes see the across-row
/// lists of line-node outputs).
pub struct DagManager {
    nodes: HashMap<String, Node>,
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    pending: HashSet<String>,
    outputs: HashMap<String, Value>,
    bypassed: HashSet<String>,
    failed: HashSet<String>,
    /// Bypassed because an upstream node failed; the taint propagates so
    /// no transitive dependent of a failure runs.
    tainted: HashSet<String>,
    flow_inputs: BTreeMap<String, Value>,
}

impl DagManager {
    pub fn new(
        nodes: Vec<Node>,
        flow_inputs: BTreeMap<String, Value>,
        preset_outputs: HashMap<String, Value>,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &nodes {
            let idx = graph.add_node(node.name.clone());
            index.insert(node.name.clone(), idx);
        }
        for node in &nodes {
            for dep in node.dependencies() {
                // Edges only between members of the subset; outside
                // dependencies are satisfied via preset outputs.
                if let (Some(&from), Some(&to)) = (index.get(dep), index.get(&node.name)) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        let pending = nodes.iter().map(|n| n.name.clone()).collect();
        Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            graph,
            index,
            pending,
            outputs: preset_outputs,
            bypassed: HashSet::new(),
            failed: HashSet::new(),
            tainted: HashSet::new(),
            flow_inputs,
        }
    }

    /// All tracked nodes have reached a terminal state.
    pub fn completed(&self) -> bool {
        self.nodes.keys().all(|name| {
            self.outputs.contains_key(name)
                || self.bypassed.contains(name)
                || self.failed.contains(name)
        })
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub fn pending_nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.iter().cloned().collect();
        names.sort();
        names
    }

    pub fn flow_inputs(&self) -> &BTreeMap<String, Value> {
        &self.flow_inputs
    }

    /// Nodes whose dependencies are all terminal and which should run.
    /// Removes them from the pending set.
    pub fn pop_ready_nodes(&mut self) -> Vec<Node> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|name| self.is_ready(name) && !self.should_bypass(name))
            .cloned()
            .collect();
        for name in &ready {
            self.pending.remove(name);
        }
        ready
            .into_iter()
            .map(|name| self.nodes[&name].clone())
            .collect()
    }

    /// Nodes whose dependencies are all terminal and which must be
    /// bypassed: a false guard, a bypassed guard dependency, every
    /// node-reference dependency bypassed, or an upstream failure.
    /// Removes them from the pending set and marks them bypassed.
    pub fn pop_bypassable_nodes(&mut self) -> Vec<Node> {
        let bypassable: Vec<String> = self
            .pending
            .iter()
            .filter(|name| self.is_ready(name) && self.should_bypass(name))
            .cloned()
            .collect();
        for name in &bypassable {
            self.pending.remove(name);
            if self.is_failure_blocked(name) {
                self.tainted.insert(name.clone());
            }
            self.bypassed.insert(name.clone());
        }
        bypassable
            .into_iter()
            .map(|name| self.nodes[&name].clone())
            .collect()
    }

    pub fn complete_node(&mut self, name: &str, output: Value) {
        self.outputs.insert(name.to_string(), output);
    }

    pub fn fail_node(&mut self, name: &str) {
        self.failed.insert(name.to_string());
    }

    /// Mark a not-yet-started node bypassed from outside the readiness
    /// rules (deadline expiry sweeps pending nodes this way).
    pub fn bypass_node(&mut self, name: &str) {
        self.pending.remove(name);
        self.bypassed.insert(name.to_string());
    }

    pub fn is_bypassed(&self, name: &str) -> bool {
        self.bypassed.contains(name)
    }

    /// Resolve the concrete input map for a node. A bypassed dependency
    /// contributes null; the dependent still runs unless every
    /// dependency was bypassed (which `pop_bypassable_nodes` catches
    /// first).
    pub fn resolve_inputs(&self, node: &Node) -> Result<BTreeMap<String, Value>, NodeError> {
        let mut resolved = BTreeMap::new();
        for (name, assignment) in &node.inputs {
            if let Some(dep) = assignment.referenced_node() {
                if self.bypassed.contains(dep) {
                    tracing::warn!(
                        node = %node.name,
                        input = %name,
                        dependency = %dep,
                        "dependency was bypassed, using null for this input"
                    );
                    resolved.insert(name.clone(), Value::Null);
                    continue;
                }
            }
            let value = self.resolve_assignment(assignment).ok_or_else(|| {
                NodeError::InputNotFound {
                    node: node.name.clone(),
                    input: name.clone(),
                }
            })?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Resolve a flow output reference against the outputs gathered so
    /// far. None when the referenced node never completed.
    pub fn resolve_output(&self, assignment: &InputAssignment) -> Option<Value> {
        self.resolve_assignment(assignment)
    }

    /// Whether the activate guard of a node holds. Only meaningful once
    /// the guard's dependency is terminal.
    pub fn guard_met(&self, node: &Node) -> bool {
        match &node.activate {
            None => true,
            Some(activate) => match self.resolve_assignment(&activate.condition) {
                Some(value) => value == activate.condition_value,
                None => false,
            },
        }
    }

    fn resolve_assignment(&self, assignment: &InputAssignment) -> Option<Value> {
        match assignment {
            InputAssignment::Literal { value } => Some(value.clone()),
            InputAssignment::FlowInput { name } => self.flow_inputs.get(name).cloned(),
            InputAssignment::NodeReference { node, property } => {
                let output = self.outputs.get(node)?;
                match property {
                    None => Some(output.clone()),
                    Some(prop) => match output.get_property(prop) {
                        Some(value) => Some(value.clone()),
                        None => {
                            tracing::warn!(
                                node = %node,
                                property = %prop,
                                "referenced property not present in node output, using null"
                            );
                            Some(Value::Null)
                        }
                    },
                }
            }
        }
    }

    fn is_ready(&self, name: &str) -> bool {
        let idx = self.index[name];
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .all(|dep_idx| {
                let dep = &self.graph[dep_idx];
                self.outputs.contains_key(dep)
                    || self.bypassed.contains(dep)
                    || self.failed.contains(dep)
            })
    }

    fn is_failure_blocked(&self, name: &str) -> bool {
        self.nodes[name].dependencies().iter().any(|dep| {
            self.failed.contains(*dep) || self.tainted.contains(*dep)
        })
    }

    fn should_bypass(&self, name: &str) -> bool {
        let node = &self.nodes[name];

        // Dependents of a failed node never run; the failure already
        // marks the row, so these stay "skipped, not executed".
        if self.is_failure_blocked(name) {
            return true;
        }

        if let Some(activate) = &node.activate {
            // A bypassed guard dependency bypasses the node outright.
            if let Some(dep) = activate.condition.referenced_node() {
                if self.bypassed.contains(dep) {
                    tracing::info!(
                        node = %node.name,
                        dependency = %dep,
                        "bypassing node: its activate condition depends on a bypassed node"
                    );
                    return true;
                }
            }
            // With a guard present, the guard alone decides.
            let met = self.guard_met(node);
            if !met {
                tracing::info!(node = %node.name, "bypassing node: activate condition not met");
            }
            return !met;
        }

        // No guard: bypass only when every node-reference dependency was
        // bypassed (and there is at least one).
        let deps: Vec<&str> = node
            .inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .collect();
        let all_bypassed = !deps.is_empty() && deps.iter().all(|d| self.bypassed.contains(*d));
        if all_bypassed {
            tracing::info!(
                node = %node.name,
                "bypassing node: all nodes it depends on were bypassed"
            );
        }
        all_bypassed
    }
}
