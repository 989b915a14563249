use async_trait::async_trait;
use flowcore::{
    validate, FlowGraph, FlowInput, InputAssignment, MemoryStorage, Node, Status, Tool,
    ToolContext, ToolError, ToolOutput, Value, ValueKind,
};
use flowruntime::{BatchConfig, BatchEngine, InputMapping, ResumeManifest};
use flowtools::ToolRegistry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Passes "value" through and counts invocations.
struct CountingTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "test.count"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::Value(
            inputs.get("value").cloned().unwrap_or(Value::Null),
        ))
    }
}

/// Panics on its first call, succeeds afterwards. Used to simulate a
/// worker crash.
struct PanicOnceTool {
    fired: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for PanicOnceTool {
    fn name(&self) -> &str {
        "test.panic_once"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            panic!("simulated worker crash");
        }
        Ok(ToolOutput::Value(
            inputs.get("value").cloned().unwrap_or(Value::Null),
        ))
    }
}

/// Blocks the executing task for "ms" milliseconds without suspending,
/// while still reporting itself cooperative. Starves the worker's
/// heartbeat loop, simulating a silently hung worker.
struct StallTool;

#[async_trait]
impl Tool for StallTool {
    fn name(&self) -> &str {
        "test.stall"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let ms = inputs.get("ms").and_then(Value::as_f64).unwrap_or(0.0);
        std::thread::sleep(Duration::from_millis(ms as u64));
        Ok(ToolOutput::Value(Value::from(ms)))
    }
}

fn row(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn echo_graph() -> FlowGraph {
    let mut graph = FlowGraph::new("echo");
    graph
        .add_input("x", FlowInput::default())
        .add_node(Node::new("echo", "debug.echo").with_input("value", InputAssignment::flow_input("x")))
        .add_output("out", InputAssignment::node_ref("echo"));
    graph
}

fn engine_with(
    graph: FlowGraph,
    registry: &ToolRegistry,
    config: BatchConfig,
) -> (BatchEngine, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let graph = validate(graph).expect("flow should validate");
    let engine = BatchEngine::new(graph, registry, storage.clone(), config);
    (engine, storage)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rows_complete_in_index_order() {
    let registry = ToolRegistry::builtins();
    let (engine, storage) = engine_with(echo_graph(), &registry, BatchConfig::default());

    let rows: Vec<_> = (0..6)
        .map(|i| row(&[("x", Value::from(format!("row{i}")))]))
        .collect();
    let mapping = InputMapping::new().with("x", "${data.x}");
    let result = engine.run(rows, &mapping, None).await;

    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.total_lines, 6);
    assert_eq!(result.completed_lines, 6);
    assert_eq!(result.failed_lines, 0);
    let indexes: Vec<usize> = result.lines.iter().map(|l| l.index).collect();
    assert_eq!(indexes, (0..6).collect::<Vec<_>>());
    for line in &result.lines {
        assert_eq!(
            line.output["out"],
            Value::String(format!("row{}", line.index))
        );
    }

    let summary = storage
        .status_summary(&result.root_run_id)
        .expect("summary persisted");
    assert_eq!(summary["lines.completed"], 6);
    assert_eq!(summary["nodes.echo.completed"], 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_literal_mapping_applies_to_every_row() {
    let registry = ToolRegistry::builtins();
    let (engine, _) = engine_with(echo_graph(), &registry, BatchConfig::default());

    let rows = vec![row(&[("ignored", Value::from(1.0))]); 2];
    let mapping = InputMapping::new().with("x", "constant");
    let result = engine.run(rows, &mapping, None).await;

    assert_eq!(result.completed_lines, 2);
    for line in &result.lines {
        assert_eq!(line.output["out"], Value::String("constant".to_string()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coercion_failure_fails_row_early() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("typed");
    graph
        .add_input(
            "n",
            FlowInput {
                kind: ValueKind::Int,
                ..FlowInput::default()
            },
        )
        .add_node(Node::new("echo", "debug.echo").with_input("value", InputAssignment::flow_input("n")))
        .add_output("out", InputAssignment::node_ref("echo"));
    let (engine, _) = engine_with(graph, &registry, BatchConfig::default());

    let rows = vec![
        row(&[("n", Value::from("5"))]),
        row(&[("n", Value::from("abc"))]),
    ];
    let result = engine.run(rows, &InputMapping::new(), None).await;

    assert_eq!(result.completed_lines, 1);
    assert_eq!(result.failed_line_indexes, vec![1]);
    assert_eq!(result.lines[0].output["out"], Value::Number(5.0));
    assert_eq!(
        result.lines[1].error.as_ref().unwrap().code,
        "InputTypeError"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresolvable_tool_fails_every_row() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("bound");
    graph.add_node(Node::new("mystery", "no.such.tool"));
    let (engine, _) = engine_with(graph, &registry, BatchConfig::default());

    let rows = vec![BTreeMap::new(), BTreeMap::new()];
    let result = engine.run(rows, &InputMapping::new(), None).await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.failed_lines, 2);
    for line in &result.lines {
        assert_eq!(line.error.as_ref().unwrap().code, "ResolveToolError");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_workers_is_pool_start_failure() {
    let registry = ToolRegistry::builtins();
    let config = BatchConfig {
        worker_count: 0,
        ..BatchConfig::default()
    };
    let (engine, _) = engine_with(echo_graph(), &registry, config);

    let rows = vec![row(&[("x", Value::from("a"))])];
    let result = engine
        .run(rows, &InputMapping::new().with("x", "${data.x}"), None)
        .await;

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.error.as_ref().unwrap().code, "PoolStartFailure");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_row_is_omitted_from_aggregation() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("timeout");
    graph
        .add_input(
            "ms",
            FlowInput {
                kind: ValueKind::Double,
                ..FlowInput::default()
            },
        )
        .add_input(
            "idx",
            FlowInput {
                kind: ValueKind::Double,
                ..FlowInput::default()
            },
        )
        .add_node(Node::new("wait", "time.delay").with_input("ms", InputAssignment::flow_input("ms")))
        .add_node(
            Node::new("val", "debug.echo")
                .with_input("value", InputAssignment::flow_input("idx"))
                .with_input("after", InputAssignment::node_ref("wait")),
        )
        .add_node(
            Node::new("summary", "aggregate.summarize")
                .with_input("values", InputAssignment::node_ref("val"))
                .with_aggregation(),
        )
        .add_output("out", InputAssignment::node_ref("val"));
    let config = BatchConfig {
        line_timeout: Duration::from_millis(500),
        ..BatchConfig::default()
    };
    let (engine, _) = engine_with(graph, &registry, config);

    let rows: Vec<_> = (0..10)
        .map(|i| {
            let ms = if i == 3 { 60_000.0 } else { 1.0 };
            row(&[("ms", Value::from(ms)), ("idx", Value::from(i as f64))])
        })
        .collect();
    let mapping = InputMapping::new()
        .with("ms", "${data.ms}")
        .with("idx", "${data.idx}");
    let result = engine.run(rows, &mapping, None).await;

    assert_eq!(result.total_lines, 10);
    assert_eq!(result.completed_lines, 9);
    assert_eq!(result.failed_line_indexes, vec![3]);
    let failed = result.lines.iter().find(|l| l.index == 3).unwrap();
    assert_eq!(
        failed.error.as_ref().unwrap().code,
        "LineExecutionTimeoutError"
    );
    // Succeeded-only aggregation: the timed-out row contributes nothing.
    let summary = result.aggregation_output["summary"].as_object().unwrap();
    assert_eq!(summary["count"], Value::Number(9.0));
    assert_eq!(result.metrics["count"], 9.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_skips_completed_rows() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::builtins();
    registry.register(Arc::new(CountingTool {
        calls: calls.clone(),
    }));

    let mut graph = FlowGraph::new("resumable");
    graph
        .add_input("x", FlowInput::default())
        .add_node(Node::new("count", "test.count").with_input("value", InputAssignment::flow_input("x")))
        .add_output("out", InputAssignment::node_ref("count"));

    let (engine, _) = engine_with(graph.clone(), &registry, BatchConfig::default());
    let rows: Vec<_> = (0..4)
        .map(|i| row(&[("x", Value::from(format!("v{i}")))]))
        .collect();
    let mapping = InputMapping::new().with("x", "${data.x}");

    let first = engine.run(rows.clone(), &mapping, None).await;
    assert_eq!(first.completed_lines, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // Resuming from an all-green result executes nothing new and
    // reproduces the same outputs.
    let manifest = ResumeManifest::from_result(&first);
    let (engine2, _) = engine_with(graph, &registry, BatchConfig::default());
    let second = engine2.run(rows, &mapping, Some(&manifest)).await;

    assert_eq!(second.completed_lines, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let firsts: Vec<_> = first.lines.iter().map(|l| &l.output).collect();
    let seconds: Vec<_> = second.lines.iter().map(|l| &l.output).collect();
    assert_eq!(firsts, seconds);
    assert_eq!(second.usage, first.usage);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_result_round_trips_through_file_for_resume() {
    let registry = ToolRegistry::builtins();
    let (engine, _) = engine_with(echo_graph(), &registry, BatchConfig::default());

    let rows: Vec<_> = (0..3)
        .map(|i| row(&[("x", Value::from(format!("v{i}")))]))
        .collect();
    let mapping = InputMapping::new().with("x", "${data.x}");
    let first = engine.run(rows.clone(), &mapping, None).await;
    assert_eq!(first.completed_lines, 3);

    // The same path the CLI takes: result to disk, reloaded on the
    // next invocation, turned into a manifest.
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("result.json");
    let serialized = serde_json::to_string_pretty(&first).expect("result serializes");
    std::fs::write(&path, serialized).expect("write result");
    let reloaded: flowruntime::BatchResult =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read result"))
            .expect("result deserializes");
    let manifest = ResumeManifest::from_result(&reloaded);

    let (engine2, _) = engine_with(echo_graph(), &registry, BatchConfig::default());
    let second = engine2.run(rows, &mapping, Some(&manifest)).await;
    assert_eq!(second.completed_lines, 3);
    for (a, b) in first.lines.iter().zip(second.lines.iter()) {
        assert_eq!(a.output, b.output);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_crash_is_retried_on_fresh_worker() {
    let fired = Arc::new(AtomicBool::new(false));
    let mut registry = ToolRegistry::builtins();
    registry.register(Arc::new(PanicOnceTool {
        fired: fired.clone(),
    }));

    let mut graph = FlowGraph::new("crashy");
    graph
        .add_input("x", FlowInput::default())
        .add_node(
            Node::new("boom", "test.panic_once")
                .with_input("value", InputAssignment::flow_input("x")),
        )
        .add_output("out", InputAssignment::node_ref("boom"));
    let config = BatchConfig {
        worker_count: 1,
        heartbeat_interval: Duration::from_millis(50),
        ..BatchConfig::default()
    };
    let (engine, _) = engine_with(graph, &registry, config);

    let rows = vec![row(&[("x", Value::from("ok"))])];
    let result = engine
        .run(rows, &InputMapping::new().with("x", "${data.x}"), None)
        .await;

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(result.completed_lines, 1);
    assert_eq!(result.lines[0].output["out"], Value::String("ok".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hung_worker_is_replaced_and_row_failed() {
    let mut registry = ToolRegistry::builtins();
    registry.register(Arc::new(StallTool));

    let mut graph = FlowGraph::new("stalled");
    graph
        .add_input(
            "ms",
            FlowInput {
                kind: ValueKind::Double,
                ..FlowInput::default()
            },
        )
        .add_node(Node::new("stall", "test.stall").with_input("ms", InputAssignment::flow_input("ms")))
        .add_output("out", InputAssignment::node_ref("stall"));
    let config = BatchConfig {
        worker_count: 1,
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_misses: 2,
        termination_timeout: Duration::from_millis(100),
        ..BatchConfig::default()
    };
    let (engine, _) = engine_with(graph, &registry, config);

    // Row 0 starves its worker's heartbeats; the supervisor must notice
    // the silence, give up on the unconfirmable termination, and still
    // serve row 1 through the replacement worker.
    let rows = vec![
        row(&[("ms", Value::from(2_000.0))]),
        row(&[("ms", Value::from(1.0))]),
    ];
    let result = engine
        .run(rows, &InputMapping::new().with("ms", "${data.ms}"), None)
        .await;

    assert_eq!(result.completed_lines, 1);
    assert_eq!(result.failed_line_indexes, vec![0]);
    let hung = result.lines.iter().find(|l| l.index == 0).unwrap();
    assert_eq!(
        hung.error.as_ref().unwrap().code,
        "WorkerTerminationTimeout"
    );
    let served = result.lines.iter().find(|l| l.index == 1).unwrap();
    assert_eq!(served.status, Status::Completed);
    assert_eq!(served.output["out"], Value::Number(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_timeout_fails_pending_rows() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("slow");
    graph
        .add_input(
            "ms",
            FlowInput {
                kind: ValueKind::Double,
                ..FlowInput::default()
            },
        )
        .add_node(Node::new("wait", "time.delay").with_input("ms", InputAssignment::flow_input("ms")));
    let config = BatchConfig {
        batch_timeout: Some(Duration::from_millis(200)),
        ..BatchConfig::default()
    };
    let (engine, _) = engine_with(graph, &registry, config);

    let rows = vec![row(&[("ms", Value::from(60_000.0))]); 3];
    let result = engine
        .run(rows, &InputMapping::new().with("ms", "${data.ms}"), None)
        .await;

    assert_eq!(result.failed_lines, 3);
    for line in &result.lines {
        assert_eq!(
            line.error.as_ref().unwrap().code,
            "BatchExecutionTimeoutError"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_retains_completed_rows() {
    let registry = ToolRegistry::builtins();
    let mut graph = FlowGraph::new("cancelable");
    graph
        .add_input(
            "ms",
            FlowInput {
                kind: ValueKind::Double,
                ..FlowInput::default()
            },
        )
        .add_node(Node::new("wait", "time.delay").with_input("ms", InputAssignment::flow_input("ms")))
        .add_output("out", InputAssignment::node_ref("wait"));
    let config = BatchConfig {
        worker_count: 2,
        ..BatchConfig::default()
    };
    let (engine, storage) = engine_with(graph, &registry, config);
    let engine = Arc::new(engine);

    let rows = vec![
        row(&[("ms", Value::from(1.0))]),
        row(&[("ms", Value::from(1.0))]),
        row(&[("ms", Value::from(60_000.0))]),
        row(&[("ms", Value::from(60_000.0))]),
    ];
    let mapping = InputMapping::new().with("ms", "${data.ms}");

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(rows, &mapping, None).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.cancel();
    let result = runner.await.expect("run task should not panic");

    assert_eq!(result.status, Status::Canceled);
    assert_eq!(result.completed_lines, 2);
    let completed: Vec<usize> = result
        .lines
        .iter()
        .filter(|l| l.status == Status::Completed)
        .map(|l| l.index)
        .collect();
    assert_eq!(completed, vec![0, 1]);

    // Canceled rows are counted as canceled, not folded into failed.
    let summary = storage
        .status_summary(&result.root_run_id)
        .expect("summary persisted");
    assert_eq!(summary["lines.completed"], 2);
    assert_eq!(summary["lines.failed"], 0);
    assert_eq!(summary["lines.canceled"], 2);
}
