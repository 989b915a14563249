use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural problems in a flow document. All of these fail fast,
/// before any node is scheduled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("flow document is malformed: {0}")]
    Schema(String),

    #[error("node '{node}' appears more than once in the flow")]
    DuplicateNode { node: String },

    #[error("{context} references '{reference}' which does not exist in the flow")]
    DanglingReference { context: String, reference: String },

    #[error("circular dependency among nodes {nodes:?}")]
    CircularDependency { nodes: Vec<String> },

    #[error(
        "invalid aggregation reference: '{node}' and '{reference}' are on \
         different sides of the aggregation boundary"
    )]
    InvalidAggregationReference { node: String, reference: String },
}

/// The tool bound to a node could not be located. Unrecoverable for the
/// row: an unbindable node cannot be scheduled at all.
#[derive(Error, Debug, Clone)]
#[error("failed to resolve tool '{tool}' for node '{node}': {message}")]
pub struct ResolveError {
    pub node: String,
    pub tool: String,
    pub message: String,
}

/// Errors raised from inside a tool's own call.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("invalid input '{field}': expected {expected}")]
    InvalidInput { field: String, expected: String },

    #[error("execution failed: {0}")]
    Execution(String),
}

/// Terminal outcome of a single node run.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("tool execution failed in node '{node}': {source}")]
    Tool {
        node: String,
        #[source]
        source: ToolError,
    },

    #[error("node '{node}' did not finish before the line deadline of {timeout_secs}s")]
    LineTimeout { node: String, timeout_secs: u64 },

    #[error("node '{node}' did not finish before the aggregation deadline of {timeout_secs}s")]
    AggregationTimeout { node: String, timeout_secs: u64 },

    #[error("node '{node}' was canceled: {reason}")]
    Canceled { node: String, reason: String },

    #[error("input '{input}' of node '{node}' could not be resolved")]
    InputNotFound { node: String, input: String },
}

/// Batch-tier failures. These are captured into run records; the batch
/// invocation itself only errors when validation fails before any row
/// starts.
#[derive(Error, Debug, Clone)]
pub enum BatchError {
    #[error("worker {worker_id} crashed while executing line {index}: {message}")]
    WorkerCrashed {
        worker_id: usize,
        index: usize,
        message: String,
    },

    #[error("worker pool failed to start: {0}")]
    PoolStartFailure(String),

    #[error("worker {worker_id} did not confirm termination within {timeout_secs}s")]
    WorkerTerminationTimeout { worker_id: usize, timeout_secs: u64 },

    #[error("batch run exceeded its deadline of {timeout_secs}s; unfinished lines: {pending:?}")]
    BatchTimeout { timeout_secs: u64, pending: Vec<usize> },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Umbrella error for the crate boundary.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Serializable error captured into a run record. `code` is a stable
/// machine-readable tag; `message` is the rendered error chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

impl RunError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&NodeError> for RunError {
    fn from(err: &NodeError) -> Self {
        let code = match err {
            NodeError::Tool { .. } => "ToolExecutionError",
            NodeError::LineTimeout { .. } => "LineExecutionTimeoutError",
            NodeError::AggregationTimeout { .. } => "AggregationNodeExecutionTimeoutError",
            NodeError::Canceled { .. } => "ToolCanceledError",
            NodeError::InputNotFound { .. } => "InputNotFound",
        };
        RunError::new(code, err.to_string())
    }
}

impl From<&ResolveError> for RunError {
    fn from(err: &ResolveError) -> Self {
        RunError::new("ResolveToolError", err.to_string())
    }
}

impl From<&BatchError> for RunError {
    fn from(err: &BatchError) -> Self {
        let code = match err {
            BatchError::WorkerCrashed { .. } => "WorkerCrashedError",
            BatchError::PoolStartFailure(_) => "PoolStartFailure",
            BatchError::WorkerTerminationTimeout { .. } => "WorkerTerminationTimeout",
            BatchError::BatchTimeout { .. } => "BatchExecutionTimeoutError",
        };
        RunError::new(code, err.to_string())
    }
}
