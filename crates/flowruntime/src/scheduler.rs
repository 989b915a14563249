use crate::dag::DagManager;
use crate::tracker::RunTracker;
use chrono::Utc;
use flowcore::{
    ApiCall, EventBus, ExecutionEvent, FlowGraph, LineRunInfo, MetricsCollector, Node, NodeError,
    NodeRunInfo, ResolveError, RunError, Status, Tool, ToolContext, ToolError, ToolOutput,
    ToolResolver, Value,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-row execution settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent nodes within one row.
    pub node_concurrency: usize,
    /// Deadline for one row.
    pub line_timeout: Duration,
    /// Deadline for the aggregation pass.
    pub aggregation_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_concurrency: 16,
            line_timeout: Duration::from_secs(600),
            aggregation_timeout: Duration::from_secs(600),
        }
    }
}

/// How nodes of one flow instance are dispatched. Chosen once per flow,
/// never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Suspension-point scheduling on the current task; no OS threads.
    /// For flows whose tools all suspend cooperatively.
    Cooperative,
    /// A bounded blocking pool; for flows with blocking tools.
    ThreadPool,
}

/// Result of one row through the flow.
#[derive(Debug, Clone)]
pub struct LineResult {
    pub output: BTreeMap<String, Value>,
    /// Outputs of the non-aggregation nodes referenced by aggregation
    /// nodes, keyed by node name.
    pub aggregation_inputs: BTreeMap<String, Value>,
    pub run_info: LineRunInfo,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
}

/// Result of the batch-scoped aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    pub output: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
}

#[derive(Clone, Copy)]
enum Phase {
    Line,
    Aggregation,
}

struct TaskDone {
    node: String,
    run_id: String,
    result: Result<ToolOutput, ToolError>,
    traces: Vec<ApiCall>,
}

struct PassOutcome {
    timed_out: bool,
    canceled: bool,
}

/// Executes one graph instance (one row, or the aggregation subgraph)
/// to completion, respecting dependencies, the deadline and the
/// cancellation token.
pub struct NodeScheduler {
    graph: Arc<FlowGraph>,
    tools: HashMap<String, Arc<dyn Tool>>,
    strategy: ExecutionStrategy,
    tracker: RunTracker,
    events: EventBus,
    config: SchedulerConfig,
}

impl NodeScheduler {
    /// Resolve every node's tool up front and pick the strategy. An
    /// unbindable node cannot be scheduled at all, so resolution failure
    /// is unrecoverable here.
    pub fn new(
        graph: Arc<FlowGraph>,
        resolver: &dyn ToolResolver,
        tracker: RunTracker,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Result<Self, ResolveError> {
        let mut tools = HashMap::new();
        for node in &graph.nodes {
            tools.insert(node.name.clone(), resolver.resolve(node)?);
        }
        let strategy = if tools.values().all(|t| t.is_suspending()) {
            ExecutionStrategy::Cooperative
        } else {
            ExecutionStrategy::ThreadPool
        };
        tracing::debug!(flow = %graph.name, ?strategy, "scheduler ready");
        Ok(Self {
            graph,
            tools,
            strategy,
            tracker,
            events,
            config,
        })
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Execute the non-aggregation subgraph for one input row.
    pub async fn exec_line(
        &self,
        inputs: BTreeMap<String, Value>,
        index: Option<usize>,
        root_run_id: &str,
        cancellation: CancellationToken,
    ) -> LineResult {
        let line_run_id = match index {
            Some(i) => format!("{root_run_id}_{i}"),
            None => format!("{root_run_id}_{}", Uuid::new_v4()),
        };
        self.tracker
            .start_line_run(&line_run_id, root_run_id, index, inputs.clone());
        self.events.emit(ExecutionEvent::LineStarted {
            root_run_id: root_run_id.to_string(),
            index,
            timestamp: Utc::now(),
        });

        let line_nodes: Vec<Node> = self
            .graph
            .nodes
            .iter()
            .filter(|n| !n.aggregation)
            .cloned()
            .collect();
        let mut dag = DagManager::new(line_nodes, inputs, HashMap::new());
        let deadline = Instant::now() + self.config.line_timeout;
        let metrics = MetricsCollector::new();
        let outcome = self
            .run_pass(
                &mut dag,
                &line_run_id,
                index,
                deadline,
                Phase::Line,
                &cancellation,
                &metrics,
            )
            .await;

        let node_run_infos: BTreeMap<String, NodeRunInfo> = self
            .tracker
            .node_runs_for_line(&line_run_id)
            .into_iter()
            .map(|info| (info.node.clone(), info.clone()))
            .collect();
        let first_error = node_run_infos
            .values()
            .filter(|info| info.status == Status::Failed)
            .min_by_key(|info| info.start_time)
            .and_then(|info| info.error.clone());

        let status = if outcome.canceled {
            Status::Canceled
        } else if outcome.timed_out || first_error.is_some() {
            Status::Failed
        } else {
            Status::Completed
        };
        let error = match status {
            Status::Canceled => Some(RunError::new(
                "ToolCanceledError",
                "line execution was canceled",
            )),
            Status::Failed => first_error.or_else(|| {
                Some(RunError::new(
                    "LineExecutionTimeoutError",
                    format!(
                        "line execution exceeded {} seconds",
                        self.config.line_timeout.as_secs()
                    ),
                ))
            }),
            _ => None,
        };

        // Partial outputs are still assembled: whatever output
        // references resolve after a timeout or failure are returned.
        let output = self.assemble_outputs(&dag);
        let aggregation_inputs = self.collect_aggregation_inputs(&dag);

        let run_info = self
            .tracker
            .end_line_run(
                &line_run_id,
                Some(Value::Object(output.clone())),
                error,
                status,
            )
            .expect("line run was started in this call");
        self.events.emit(ExecutionEvent::LineCompleted {
            root_run_id: root_run_id.to_string(),
            index,
            status,
            duration_ms: run_info.system_metrics.duration_ms,
            timestamp: Utc::now(),
        });

        LineResult {
            output,
            aggregation_inputs,
            run_info,
            node_run_infos,
        }
    }

    /// Execute the aggregation-only subgraph once, with each referenced
    /// line-level value supplied as the full across-row list. Failures
    /// here are downgraded to warnings by the caller; this method only
    /// reports what completed.
    pub async fn exec_aggregation(
        &self,
        flow_input_lists: BTreeMap<String, Value>,
        aggregation_inputs: BTreeMap<String, Value>,
        root_run_id: &str,
        cancellation: CancellationToken,
    ) -> AggregationResult {
        let aggregation_nodes: Vec<Node> = self
            .graph
            .nodes
            .iter()
            .filter(|n| n.aggregation)
            .cloned()
            .collect();
        if aggregation_nodes.is_empty() {
            return AggregationResult::default();
        }
        tracing::info!(count = aggregation_nodes.len(), "executing aggregation nodes");

        let preset: HashMap<String, Value> = aggregation_inputs.into_iter().collect();
        let mut dag = DagManager::new(aggregation_nodes, flow_input_lists, preset);
        let deadline = Instant::now() + self.config.aggregation_timeout;
        let metrics = MetricsCollector::new();
        self.run_pass(
            &mut dag,
            root_run_id,
            None,
            deadline,
            Phase::Aggregation,
            &cancellation,
            &metrics,
        )
        .await;

        let node_run_infos: BTreeMap<String, NodeRunInfo> = self
            .tracker
            .node_runs_for_line(root_run_id)
            .into_iter()
            .map(|info| (info.node.clone(), info.clone()))
            .collect();
        let output = dag
            .outputs()
            .iter()
            .filter(|(name, _)| node_run_infos.contains_key(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        AggregationResult {
            output,
            metrics: metrics.snapshot(),
            node_run_infos,
        }
    }

    /// Shared drive loop: settle bypasses, dispatch ready nodes up to
    /// the concurrency bound, then wait for a completion, the deadline
    /// or cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        dag: &mut DagManager,
        line_run_id: &str,
        index: Option<usize>,
        deadline: Instant,
        phase: Phase,
        cancellation: &CancellationToken,
        metrics: &MetricsCollector,
    ) -> PassOutcome {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, TaskDone>> = FuturesUnordered::new();
        let mut in_flight_ids: HashMap<String, String> = HashMap::new();
        let mut ready_queue: VecDeque<Node> = VecDeque::new();
        let mut timed_out = false;
        let mut canceled = false;

        loop {
            // Bypassing one node can make the next bypassable, so settle
            // chains before dispatching.
            loop {
                let bypassed = dag.pop_bypassable_nodes();
                if bypassed.is_empty() {
                    break;
                }
                for node in bypassed {
                    self.record_bypass(&node.name, line_run_id, index);
                }
            }
            ready_queue.extend(dag.pop_ready_nodes());

            while in_flight.len() < self.config.node_concurrency.max(1) {
                let Some(node) = ready_queue.pop_front() else {
                    break;
                };
                match self.dispatch(dag, &node, line_run_id, index, cancellation, metrics) {
                    Some((run_id, fut)) => {
                        in_flight_ids.insert(node.name.clone(), run_id);
                        in_flight.push(fut);
                    }
                    None => {
                        // Input resolution failed; the node is already
                        // recorded Failed and the dag updated.
                    }
                }
            }

            if in_flight.is_empty() && ready_queue.is_empty() {
                break;
            }

            tokio::select! {
                done = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(done) = done {
                        in_flight_ids.remove(&done.node);
                        self.settle(dag, done, line_run_id);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = cancellation.cancelled() => {
                    canceled = true;
                    break;
                }
            }
        }

        if timed_out {
            let timeout_secs = match phase {
                Phase::Line => self.config.line_timeout.as_secs(),
                Phase::Aggregation => self.config.aggregation_timeout.as_secs(),
            };
            tracing::warn!(
                run_id = %line_run_id,
                timeout_secs,
                "deadline expired, failing in-flight nodes and bypassing the rest"
            );
            // In-flight nodes become Failed; their tasks are not killed,
            // only their results are discarded when `in_flight` drops.
            for (node, run_id) in in_flight_ids.drain() {
                let err = match phase {
                    Phase::Line => NodeError::LineTimeout {
                        node: node.clone(),
                        timeout_secs,
                    },
                    Phase::Aggregation => NodeError::AggregationTimeout {
                        node: node.clone(),
                        timeout_secs,
                    },
                };
                self.tracker.end_node_run(&run_id, Err(err), Vec::new());
                dag.fail_node(&node);
            }
            // Not-yet-started nodes are Bypassed, not errors.
            for node in ready_queue.drain(..) {
                dag.bypass_node(&node.name);
                self.record_bypass(&node.name, line_run_id, index);
            }
            for name in dag.pending_nodes() {
                dag.bypass_node(&name);
                self.record_bypass(&name, line_run_id, index);
            }
        }

        if canceled {
            tracing::info!(run_id = %line_run_id, "cancellation observed, halting dispatch");
            self.tracker
                .cancel_node_runs(line_run_id, "received cancel request");
        }

        PassOutcome {
            timed_out,
            canceled,
        }
    }

    /// Start one node run and build its in-flight future. Returns None
    /// when input resolution fails, recording the failure.
    fn dispatch(
        &self,
        dag: &mut DagManager,
        node: &Node,
        line_run_id: &str,
        index: Option<usize>,
        cancellation: &CancellationToken,
        metrics: &MetricsCollector,
    ) -> Option<(String, BoxFuture<'static, TaskDone>)> {
        let run_id = format!("{line_run_id}:{}", node.name);
        let inputs = match dag.resolve_inputs(node) {
            Ok(inputs) => inputs,
            Err(err) => {
                self.tracker
                    .start_node_run(&node.name, &run_id, line_run_id, index, BTreeMap::new());
                self.tracker.end_node_run(&run_id, Err(err), Vec::new());
                dag.fail_node(&node.name);
                return None;
            }
        };
        self.tracker
            .start_node_run(&node.name, &run_id, line_run_id, index, inputs.clone());
        self.events.emit(ExecutionEvent::NodeStarted {
            line_run_id: line_run_id.to_string(),
            node: node.name.clone(),
            timestamp: Utc::now(),
        });

        let tool = self.tools[&node.name].clone();
        let mut ctx = ToolContext::new(line_run_id, &run_id, &node.name, cancellation.clone());
        ctx.metrics = metrics.clone();
        let collector = ctx.traces.clone();
        let node_name = node.name.clone();
        let task_run_id = run_id.clone();

        let fut: BoxFuture<'static, TaskDone> = match self.strategy {
            ExecutionStrategy::Cooperative => Box::pin(async move {
                let result = tool.call(ctx, inputs).await;
                TaskDone {
                    node: node_name,
                    run_id: task_run_id,
                    result,
                    traces: collector.drain(),
                }
            }),
            ExecutionStrategy::ThreadPool => {
                let runtime = tokio::runtime::Handle::current();
                let handle =
                    tokio::task::spawn_blocking(move || runtime.block_on(tool.call(ctx, inputs)));
                Box::pin(async move {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(ToolError::Execution(format!("tool thread panicked: {e}"))),
                    };
                    TaskDone {
                        node: node_name,
                        run_id: task_run_id,
                        result,
                        traces: collector.drain(),
                    }
                })
            }
        };
        Some((run_id, fut))
    }

    /// Finalize a completed dispatch: drain streams, record the terminal
    /// state, update the dag.
    fn settle(&self, dag: &mut DagManager, done: TaskDone, line_run_id: &str) {
        match done.result {
            Ok(output) => {
                // Streams are drained exactly once, here.
                let value = match output {
                    ToolOutput::Value(v) => v,
                    ToolOutput::Stream(stream) => stream.drain_flatten(),
                };
                let info = self
                    .tracker
                    .end_node_run(&done.run_id, Ok(value.clone()), done.traces);
                self.events.emit(ExecutionEvent::NodeCompleted {
                    line_run_id: line_run_id.to_string(),
                    node: done.node.clone(),
                    duration_ms: info.map(|i| i.system_metrics.duration_ms).unwrap_or(0),
                    timestamp: Utc::now(),
                });
                dag.complete_node(&done.node, value);
            }
            Err(tool_error) => {
                let err = NodeError::Tool {
                    node: done.node.clone(),
                    source: tool_error,
                };
                tracing::error!(node = %done.node, error = %err, "node failed");
                self.events.emit(ExecutionEvent::NodeFailed {
                    line_run_id: line_run_id.to_string(),
                    node: done.node.clone(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                self.tracker
                    .end_node_run(&done.run_id, Err(err), done.traces);
                dag.fail_node(&done.node);
            }
        }
    }

    fn record_bypass(&self, node: &str, line_run_id: &str, index: Option<usize>) {
        let run_id = format!("{line_run_id}:{node}");
        self.tracker
            .bypass_node_run(node, &run_id, line_run_id, index);
        self.events.emit(ExecutionEvent::NodeBypassed {
            line_run_id: line_run_id.to_string(),
            node: node.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Assemble row outputs strictly from the declared output
    /// references. References that cannot resolve (their node never
    /// completed) are omitted.
    fn assemble_outputs(&self, dag: &DagManager) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        for (name, output) in &self.graph.outputs {
            if let Some(value) = dag.resolve_output(&output.reference) {
                outputs.insert(name.clone(), value);
            }
        }
        outputs
    }

    fn collect_aggregation_inputs(&self, dag: &DagManager) -> BTreeMap<String, Value> {
        self.graph
            .aggregation_input_nodes()
            .into_iter()
            .map(|name| {
                let value = dag.outputs().get(name).cloned().unwrap_or(Value::Null);
                (name.to_string(), value)
            })
            .collect()
    }
}
