//! Core abstractions for the flow execution engine.
//!
//! This crate provides the graph model and validator, run records, the
//! storage and tool boundaries, and the error taxonomy that the runtime
//! crates depend on. It contains no execution logic.

mod error;
pub mod events;
mod flow;
mod run_info;
mod storage;
mod tool;
mod validator;
mod value;

pub use error::{
    BatchError, FlowError, NodeError, ResolveError, Result, RunError, StorageError, ToolError,
    ValidationError,
};
pub use events::{EventBus, ExecutionEvent};
pub use flow::{
    Activate, FlowGraph, FlowInput, FlowOutput, InputAssignment, Node, ValueKind,
};
pub use run_info::{ApiCall, LineRunInfo, NodeRunInfo, Status, SystemMetrics, USAGE_KEYS};
pub use storage::{MemoryStorage, NoopStorage, RunStorage};
pub use tool::{
    require_input, MetricsCollector, Tool, ToolContext, ToolOutput, ToolResolver, TraceCollector,
    ValueStream,
};
pub use validator::validate;
pub use value::Value;
