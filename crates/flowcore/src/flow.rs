use crate::error::ValidationError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a node input takes its value from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case", deny_unknown_fields)]
pub enum InputAssignment {
    /// A constant baked into the flow document.
    Literal { value: Value },
    /// A declared flow input, filled per row.
    FlowInput { name: String },
    /// The output of another node, optionally narrowed to one property.
    NodeReference {
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        property: Option<String>,
    },
}

impl InputAssignment {
    pub fn literal(value: impl Into<Value>) -> Self {
        InputAssignment::Literal {
            value: value.into(),
        }
    }

    pub fn flow_input(name: impl Into<String>) -> Self {
        InputAssignment::FlowInput { name: name.into() }
    }

    pub fn node_ref(node: impl Into<String>) -> Self {
        InputAssignment::NodeReference {
            node: node.into(),
            property: None,
        }
    }

    pub fn node_ref_property(node: impl Into<String>, property: impl Into<String>) -> Self {
        InputAssignment::NodeReference {
            node: node.into(),
            property: Some(property.into()),
        }
    }

    /// The node this assignment depends on, if any.
    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            InputAssignment::NodeReference { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// Per-node activation guard: the node runs only when the resolved
/// condition equals `condition_value`; otherwise it is bypassed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Activate {
    pub condition: InputAssignment,
    pub condition_value: Value,
}

/// One step of the flow, bound to a tool by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputAssignment>,
    #[serde(default)]
    pub aggregation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<Activate>,
}

impl Node {
    pub fn new(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            inputs: BTreeMap::new(),
            aggregation: false,
            activate: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, assignment: InputAssignment) -> Self {
        self.inputs.insert(name.into(), assignment);
        self
    }

    pub fn with_aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    pub fn with_activate(mut self, condition: InputAssignment, value: impl Into<Value>) -> Self {
        self.activate = Some(Activate {
            condition,
            condition_value: value.into(),
        });
        self
    }

    /// Node names this node depends on: every node-reference input plus
    /// the activate guard (guards count as dependencies).
    pub fn dependencies(&self) -> BTreeSet<&str> {
        let mut deps: BTreeSet<&str> = self
            .inputs
            .values()
            .filter_map(InputAssignment::referenced_node)
            .collect();
        if let Some(activate) = &self.activate {
            if let Some(node) = activate.condition.referenced_node() {
                deps.insert(node);
            }
        }
        deps
    }
}

/// Declared kind of a flow input, used to coerce batch columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    String,
    Int,
    Double,
    Bool,
    List,
    Object,
}

impl ValueKind {
    /// Coerce a raw row value into the declared kind. Strings are parsed
    /// (JSON for list/object); anything already of the right shape passes
    /// through.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        match (self, &value) {
            (ValueKind::String, Value::String(_)) => Ok(value),
            (ValueKind::String, other) => Ok(Value::String(other.to_string())),
            (ValueKind::Int, Value::Number(n)) if n.fract() == 0.0 => Ok(value),
            (ValueKind::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("'{s}' is not an int: {e}")),
            (ValueKind::Double, Value::Number(_)) => Ok(value),
            (ValueKind::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|e| format!("'{s}' is not a double: {e}")),
            (ValueKind::Bool, Value::Bool(_)) => Ok(value),
            (ValueKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("'{s}' is not a bool")),
            },
            (ValueKind::List, Value::Array(_)) => Ok(value),
            (ValueKind::List, Value::String(s)) => Self::parse_json(s).and_then(|v| match v {
                Value::Array(_) => Ok(v),
                _ => Err(format!("'{s}' is not a JSON list")),
            }),
            (ValueKind::Object, Value::Object(_)) => Ok(value),
            (ValueKind::Object, Value::String(s)) => Self::parse_json(s).and_then(|v| match v {
                Value::Object(_) => Ok(v),
                _ => Err(format!("'{s}' is not a JSON object")),
            }),
            (kind, other) => Err(format!("value '{other}' does not match declared type {kind:?}")),
        }
    }

    fn parse_json(s: &str) -> Result<Value, String> {
        serde_json::from_str::<serde_json::Value>(s)
            .map(Value::from)
            .map_err(|e| format!("invalid JSON: {e}"))
    }
}

/// Declared flow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FlowInput {
    #[serde(rename = "type", default)]
    pub kind: ValueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub is_chat_input: bool,
    #[serde(default)]
    pub is_chat_history: bool,
}

/// Declared flow output, assembled after per-row execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowOutput {
    pub reference: InputAssignment,
}

/// The declarative DAG: nodes in declaration order plus declared inputs
/// and outputs. Parsed, validated once, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowGraph {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub inputs: BTreeMap<String, FlowInput>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FlowOutput>,
}

impl FlowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Parse a flow document, failing fast on schema problems so a
    /// malformed document never reaches the scheduler.
    pub fn from_json(doc: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(doc).map_err(|e| ValidationError::Schema(e.to_string()))
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn add_input(&mut self, name: impl Into<String>, input: FlowInput) -> &mut Self {
        self.inputs.insert(name.into(), input);
        self
    }

    pub fn add_output(&mut self, name: impl Into<String>, reference: InputAssignment) -> &mut Self {
        self.outputs.insert(name.into(), FlowOutput { reference });
        self
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn has_aggregation_nodes(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }

    pub fn aggregation_node_names(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter(|n| n.aggregation)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Non-aggregation nodes whose outputs feed aggregation nodes. Their
    /// per-row outputs are collected into across-row lists for the
    /// aggregation phase.
    pub fn aggregation_input_nodes(&self) -> BTreeSet<&str> {
        let aggregation: BTreeSet<&str> = self.aggregation_node_names();
        self.nodes
            .iter()
            .filter(|n| n.aggregation)
            .flat_map(|n| n.dependencies())
            .filter(|dep| !aggregation.contains(dep))
            .collect()
    }

    /// Apply declared defaults for inputs missing from a row.
    pub fn apply_input_defaults(&self, inputs: &mut BTreeMap<String, Value>) {
        for (name, def) in &self.inputs {
            if !inputs.contains_key(name) {
                if let Some(default) = &def.default {
                    inputs.insert(name.clone(), default.clone());
                }
            }
        }
    }
}
