use crate::error::{ResolveError, ToolError};
use crate::flow::Node;
use crate::run_info::ApiCall;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A lazy, finite, non-restartable chunk sequence produced by a
/// streaming tool. The scheduler drains it exactly once per node.
pub struct ValueStream {
    inner: Box<dyn Iterator<Item = Value> + Send>,
}

impl ValueStream {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        Self {
            inner: Box::new(iter),
        }
    }

    /// Drain the stream and flatten the chunks: string chunks
    /// concatenate, anything else becomes an array.
    pub fn drain_flatten(self) -> Value {
        let chunks: Vec<Value> = self.inner.collect();
        if chunks.iter().all(|c| matches!(c, Value::String(_))) {
            let mut joined = String::new();
            for chunk in &chunks {
                if let Value::String(s) = chunk {
                    joined.push_str(s);
                }
            }
            Value::String(joined)
        } else {
            Value::Array(chunks)
        }
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueStream")
    }
}

/// What a tool call yields: an immediate value or a chunk stream.
#[derive(Debug)]
pub enum ToolOutput {
    Value(Value),
    Stream(ValueStream),
}

impl ToolOutput {
    pub fn value(v: impl Into<Value>) -> Self {
        ToolOutput::Value(v.into())
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Value(v)
    }
}

/// Collects call traces emitted by a tool during one node run.
#[derive(Clone, Default)]
pub struct TraceCollector {
    calls: Arc<Mutex<Vec<ApiCall>>>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn drain(&self) -> Vec<ApiCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

/// Collects named metrics logged by aggregation tools.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_metric(&self, name: impl Into<String>, value: f64) {
        self.metrics.lock().unwrap().insert(name.into(), value);
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.metrics.lock().unwrap().clone()
    }
}

/// Execution context threaded into each tool call. Explicit rather than
/// ambient: the run ids, cancellation token and sinks travel with the
/// call instead of living in task-local state.
#[derive(Clone)]
pub struct ToolContext {
    pub line_run_id: String,
    pub node_run_id: String,
    pub node_name: String,
    pub cancellation: CancellationToken,
    pub traces: TraceCollector,
    pub metrics: MetricsCollector,
}

impl ToolContext {
    pub fn new(
        line_run_id: impl Into<String>,
        node_run_id: impl Into<String>,
        node_name: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            line_run_id: line_run_id.into(),
            node_run_id: node_run_id.into(),
            node_name: node_name.into(),
            cancellation,
            traces: TraceCollector::new(),
            metrics: MetricsCollector::new(),
        }
    }
}

/// An invokable unit bound to a node.
///
/// `is_suspending` declares the cooperative variant: suspending tools
/// await inside their own call and may share one thread; non-suspending
/// tools block and are dispatched on the blocking pool. A flow instance
/// picks its scheduling strategy from these flags once and never mixes.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry identifier, e.g. "template.render".
    fn name(&self) -> &str;

    fn is_suspending(&self) -> bool {
        true
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError>;
}

impl fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Binds each node to an invokable unit. Resolution failure is
/// unrecoverable for the row: an unbindable node cannot be scheduled.
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, node: &Node) -> Result<Arc<dyn Tool>, ResolveError>;
}

/// Convenience for pulling a required input inside a tool.
pub fn require_input<'a>(
    inputs: &'a BTreeMap<String, Value>,
    name: &str,
) -> Result<&'a Value, ToolError> {
    inputs
        .get(name)
        .ok_or_else(|| ToolError::MissingInput(name.to_string()))
}
