use async_trait::async_trait;
use flowcore::{
    validate, EventBus, FlowGraph, FlowInput, InputAssignment, MemoryStorage, Node, Status, Tool,
    ToolContext, ToolError, ToolOutput, Value, ValueStream,
};
use flowruntime::{ExecutionStrategy, NodeScheduler, RunTracker, SchedulerConfig};
use flowtools::ToolRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records which node ran it and in what order, then passes "value"
/// through.
struct ProbeTool {
    log: Arc<Mutex<Vec<String>>>,
    suspending: bool,
}

#[async_trait]
impl Tool for ProbeTool {
    fn name(&self) -> &str {
        "test.probe"
    }

    fn is_suspending(&self) -> bool {
        self.suspending
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        self.log.lock().unwrap().push(ctx.node_name.clone());
        let value = inputs.get("value").cloned().unwrap_or(Value::Null);
        Ok(ToolOutput::Value(value))
    }
}

struct FailTool;

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "test.fail"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        _inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        Err(ToolError::Execution("boom".to_string()))
    }
}

/// Emits its "chunks" array one element at a time as a stream.
struct StreamTool;

#[async_trait]
impl Tool for StreamTool {
    fn name(&self) -> &str {
        "test.stream"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let chunks = inputs
            .get("chunks")
            .and_then(|v| v.as_array().map(<[Value]>::to_vec))
            .unwrap_or_default();
        Ok(ToolOutput::Stream(ValueStream::new(chunks.into_iter())))
    }
}

fn setup(
    graph: FlowGraph,
    registry: &ToolRegistry,
    config: SchedulerConfig,
) -> (NodeScheduler, RunTracker, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let tracker = RunTracker::new(storage.clone());
    let graph = Arc::new(validate(graph).expect("flow should validate"));
    let scheduler = NodeScheduler::new(
        graph,
        registry,
        tracker.clone(),
        EventBus::default(),
        config,
    )
    .expect("tools should resolve");
    (scheduler, tracker, storage)
}

fn probe_registry(suspending: bool) -> (ToolRegistry, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::builtins();
    registry.register(Arc::new(ProbeTool {
        log: log.clone(),
        suspending,
    }));
    registry.register(Arc::new(FailTool));
    registry.register(Arc::new(StreamTool));
    (registry, log)
}

fn chain_graph() -> FlowGraph {
    let mut graph = FlowGraph::new("chain");
    graph
        .add_node(Node::new("a", "test.probe").with_input("value", InputAssignment::literal(1.0)))
        .add_node(Node::new("b", "test.probe").with_input("value", InputAssignment::node_ref("a")))
        .add_output("out", InputAssignment::node_ref("b"));
    graph
}

#[tokio::test]
async fn test_dependency_order_cooperative() {
    let (registry, log) = probe_registry(true);
    let (scheduler, _, _) = setup(chain_graph(), &registry, SchedulerConfig::default());
    assert_eq!(scheduler.strategy(), ExecutionStrategy::Cooperative);

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(line.output["out"], Value::Number(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dependency_order_thread_pool() {
    let (registry, log) = probe_registry(false);
    let (scheduler, _, _) = setup(chain_graph(), &registry, SchedulerConfig::default());
    assert_eq!(scheduler.strategy(), ExecutionStrategy::ThreadPool);

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_false_guard_bypasses_but_dependent_runs() {
    let (registry, log) = probe_registry(true);
    let mut graph = FlowGraph::new("guarded");
    graph
        .add_node(Node::new("gate", "test.probe").with_input("value", InputAssignment::literal(false)))
        .add_node(
            Node::new("guarded", "test.probe")
                .with_input("value", InputAssignment::literal("skipped"))
                .with_activate(InputAssignment::node_ref("gate"), true),
        )
        .add_node(
            Node::new("after", "test.probe")
                .with_input("value", InputAssignment::node_ref("guarded"))
                .with_input("live", InputAssignment::node_ref("gate")),
        );
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Completed);
    assert_eq!(line.node_run_infos["guarded"].status, Status::Bypassed);
    // The dependent still executes, with null standing in for the
    // bypassed output.
    let after = &line.node_run_infos["after"];
    assert_eq!(after.status, Status::Completed);
    assert_eq!(after.output, Some(Value::Null));
    assert!(!log.lock().unwrap().contains(&"guarded".to_string()));
}

#[tokio::test]
async fn test_node_with_all_dependencies_bypassed_is_bypassed() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("cascade");
    graph
        .add_node(Node::new("gate", "test.probe").with_input("value", InputAssignment::literal(false)))
        .add_node(
            Node::new("skipped", "test.probe")
                .with_input("value", InputAssignment::literal(1.0))
                .with_activate(InputAssignment::node_ref("gate"), true),
        )
        .add_node(
            Node::new("downstream", "test.probe")
                .with_input("value", InputAssignment::node_ref("skipped"))
                .with_activate(InputAssignment::node_ref("skipped"), true),
        );
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Completed);
    assert_eq!(line.node_run_infos["skipped"].status, Status::Bypassed);
    // Its guard depends on a bypassed node, so it is bypassed too.
    assert_eq!(line.node_run_infos["downstream"].status, Status::Bypassed);
}

#[tokio::test]
async fn test_failure_bypasses_dependents_but_not_siblings() {
    let (registry, log) = probe_registry(true);
    let mut graph = FlowGraph::new("fail");
    graph
        .add_node(Node::new("bad", "test.fail"))
        .add_node(
            Node::new("dependent", "test.probe")
                .with_input("value", InputAssignment::node_ref("bad")),
        )
        .add_node(
            Node::new("sibling", "test.probe").with_input("value", InputAssignment::literal(7.0)),
        );
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Failed);
    assert_eq!(line.node_run_infos["bad"].status, Status::Failed);
    assert_eq!(
        line.node_run_infos["bad"].error.as_ref().unwrap().code,
        "ToolExecutionError"
    );
    assert_eq!(line.node_run_infos["dependent"].status, Status::Bypassed);
    assert_eq!(line.node_run_infos["sibling"].status, Status::Completed);
    assert!(log.lock().unwrap().contains(&"sibling".to_string()));
}

#[tokio::test]
async fn test_string_stream_is_drained_and_concatenated() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("stream");
    graph
        .add_node(Node::new("s", "test.stream").with_input(
            "chunks",
            InputAssignment::literal(vec![
                Value::from("hel"),
                Value::from("lo"),
            ]),
        ))
        .add_output("text", InputAssignment::node_ref("s"));
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Completed);
    assert_eq!(line.output["text"], Value::String("hello".to_string()));
}

#[tokio::test]
async fn test_line_timeout_fails_in_flight_and_bypasses_pending() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("slow");
    graph
        .add_node(
            Node::new("slow", "time.delay").with_input("ms", InputAssignment::literal(60_000.0)),
        )
        .add_node(
            Node::new("after", "test.probe").with_input("value", InputAssignment::node_ref("slow")),
        );
    let config = SchedulerConfig {
        line_timeout: Duration::from_millis(100),
        ..SchedulerConfig::default()
    };
    let (scheduler, _, _) = setup(graph, &registry, config);

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Failed);
    let slow = &line.node_run_infos["slow"];
    assert_eq!(slow.status, Status::Failed);
    assert_eq!(
        slow.error.as_ref().unwrap().code,
        "LineExecutionTimeoutError"
    );
    assert_eq!(line.node_run_infos["after"].status, Status::Bypassed);
}

#[tokio::test]
async fn test_cancellation_marks_in_flight_canceled() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("cancel");
    graph.add_node(
        Node::new("slow", "time.delay").with_input("ms", InputAssignment::literal(60_000.0)),
    );
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", token)
        .await;

    assert_eq!(line.run_info.status, Status::Canceled);
    assert_eq!(line.node_run_infos["slow"].status, Status::Canceled);
}

#[tokio::test]
async fn test_partial_outputs_survive_failure() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("partial");
    graph
        .add_node(Node::new("ok", "test.probe").with_input("value", InputAssignment::literal(5.0)))
        .add_node(Node::new("bad", "test.fail"))
        .add_output("good", InputAssignment::node_ref("ok"))
        .add_output("broken", InputAssignment::node_ref("bad"));
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let line = scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    assert_eq!(line.run_info.status, Status::Failed);
    assert_eq!(line.output.get("good"), Some(&Value::Number(5.0)));
    assert!(!line.output.contains_key("broken"));
}

#[tokio::test]
async fn test_aggregation_pass_sees_across_row_lists() {
    let (registry, _) = probe_registry(true);
    let mut graph = FlowGraph::new("agg");
    graph
        .add_input("x", FlowInput::default())
        .add_node(Node::new("row", "test.probe").with_input("value", InputAssignment::flow_input("x")))
        .add_node(
            Node::new("summary", "aggregate.summarize")
                .with_input("values", InputAssignment::node_ref("row"))
                .with_aggregation(),
        );
    let (scheduler, _, _) = setup(graph, &registry, SchedulerConfig::default());

    let mut flow_inputs = BTreeMap::new();
    flow_inputs.insert(
        "x".to_string(),
        Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")]),
    );
    let mut aggregation_inputs = BTreeMap::new();
    aggregation_inputs.insert(
        "row".to_string(),
        Value::Array(vec![Value::from(1.0), Value::from(2.0), Value::from(3.0)]),
    );
    let result = scheduler
        .exec_aggregation(flow_inputs, aggregation_inputs, "run", CancellationToken::new())
        .await;

    let summary = result.output["summary"].as_object().unwrap();
    assert_eq!(summary["count"], Value::Number(3.0));
    assert_eq!(summary["mean"], Value::Number(2.0));
    assert_eq!(result.metrics["count"], 3.0);
    // Aggregation node runs are batch-scoped: no row index.
    assert_eq!(result.node_run_infos["summary"].index, None);
}

#[tokio::test]
async fn test_aggregation_timeout_fails_in_flight_node() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("slow_agg");
    graph.add_node(
        Node::new("slow", "time.delay")
            .with_input("ms", InputAssignment::literal(60_000.0))
            .with_aggregation(),
    );
    let config = SchedulerConfig {
        aggregation_timeout: Duration::from_millis(100),
        ..SchedulerConfig::default()
    };
    let (scheduler, _, _) = setup(graph, &registry, config);

    let result = scheduler
        .exec_aggregation(
            BTreeMap::new(),
            BTreeMap::new(),
            "run",
            CancellationToken::new(),
        )
        .await;

    assert!(result.output.is_empty());
    let info = &result.node_run_infos["slow"];
    assert_eq!(info.status, Status::Failed);
    assert_eq!(
        info.error.as_ref().unwrap().code,
        "AggregationNodeExecutionTimeoutError"
    );
}

#[tokio::test]
async fn test_node_records_persisted_with_terminal_status() {
    let (registry, _) = probe_registry(true);
    let (scheduler, _, storage) = setup(chain_graph(), &registry, SchedulerConfig::default());

    scheduler
        .exec_line(BTreeMap::new(), Some(0), "run", CancellationToken::new())
        .await;

    let node_runs = storage.node_runs();
    assert_eq!(node_runs.len(), 2);
    assert!(node_runs.iter().all(|r| r.status == Status::Completed));
    assert!(node_runs.iter().all(|r| r.end_time.is_some()));
    let line_runs = storage.line_runs();
    assert_eq!(line_runs.len(), 1);
    assert_eq!(line_runs[0].status, Status::Completed);
}
