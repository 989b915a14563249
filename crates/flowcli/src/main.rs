use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    EventBus, ExecutionEvent, FlowGraph, NoopStorage, Status, Value,
};
use flowruntime::{
    BatchConfig, BatchEngine, InputMapping, NodeScheduler, ResumeManifest, RunTracker,
    SchedulerConfig,
};
use flowtools::ToolRegistry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow execution CLI", long_about = None)]
struct Cli {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// Execute a flow once against a single input
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Execute a flow over a JSONL row set
    Batch {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Path to JSONL data, one row object per line
        #[arg(short, long)]
        data: PathBuf,

        /// Column mapping, e.g. -m question='${data.question}'
        #[arg(short = 'm', long = "map", value_name = "INPUT=EXPR")]
        mappings: Vec<String>,

        /// Concurrent rows
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Per-row timeout in seconds
        #[arg(long, default_value_t = 600)]
        line_timeout: u64,

        /// Batch timeout in seconds
        #[arg(long)]
        batch_timeout: Option<u64>,

        /// A previous result file to resume from
        #[arg(long)]
        resume_from: Option<PathBuf>,

        /// Where to write the result JSON
        #[arg(short, long, default_value = "batch_result.json")]
        output: PathBuf,
    },

    /// List available tools
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Validate { file } => validate_flow(file),
        Commands::Run { file, input } => run_flow(file, input).await,
        Commands::Batch {
            file,
            data,
            mappings,
            workers,
            line_timeout,
            batch_timeout,
            resume_from,
            output,
        } => {
            run_batch(
                file,
                data,
                mappings,
                workers,
                line_timeout,
                batch_timeout,
                resume_from,
                output,
            )
            .await
        }
        Commands::Tools => {
            list_tools();
            Ok(())
        }
    }
}

fn load_flow(file: &PathBuf) -> Result<FlowGraph> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let graph = FlowGraph::from_json(&text)?;
    Ok(flowcore::validate(graph)?)
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());
    let graph = load_flow(&file)?;
    println!("✅ Flow is valid:");
    println!("   Name: {}", graph.name);
    println!("   Inputs: {}", graph.inputs.len());
    println!("   Outputs: {}", graph.outputs.len());
    println!("   Execution order:");
    for node in &graph.nodes {
        let marker = if node.aggregation { " (aggregation)" } else { "" };
        println!("     {} [{}]{}", node.name, node.tool, marker);
    }
    Ok(())
}

fn parse_input_object(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(input) = input else {
        return Ok(BTreeMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&input).context("parsing --input")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("input must be a JSON object")),
    }
}

fn spawn_event_printer(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::BatchStarted { total_lines, .. } => {
                    println!("▶️  Batch started: {total_lines} rows");
                }
                ExecutionEvent::LineCompleted {
                    index,
                    status,
                    duration_ms,
                    ..
                } => {
                    let label = index.map_or_else(|| "-".to_string(), |i| i.to_string());
                    match status {
                        Status::Completed => {
                            println!("  ✅ Row {label} completed in {duration_ms}ms")
                        }
                        Status::Failed => println!("  ❌ Row {label} failed"),
                        Status::Canceled => println!("  🛑 Row {label} canceled"),
                        _ => {}
                    }
                }
                ExecutionEvent::NodeFailed { node, error, .. } => {
                    println!("     ❌ Node {node} failed: {error}");
                }
                ExecutionEvent::NodeBypassed { node, .. } => {
                    println!("     ⏭️  Node {node} bypassed");
                }
                ExecutionEvent::BatchCompleted {
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("✨ Batch finished: {status:?} in {duration_ms}ms");
                }
                _ => {}
            }
        }
    })
}

async fn run_flow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let graph = Arc::new(load_flow(&file)?);
    let inputs = {
        let mut inputs = parse_input_object(input)?;
        graph.apply_input_defaults(&mut inputs);
        inputs
    };

    let registry = ToolRegistry::builtins();
    let tracker = RunTracker::new(Arc::new(NoopStorage));
    let events = EventBus::default();
    let scheduler = NodeScheduler::new(
        graph.clone(),
        &registry,
        tracker,
        events,
        SchedulerConfig::default(),
    )?;

    let root_run_id = "local".to_string();
    let cancellation = CancellationToken::new();
    let line = scheduler
        .exec_line(inputs.clone(), None, &root_run_id, cancellation.clone())
        .await;

    println!();
    println!("📊 Line status: {:?}", line.run_info.status);
    for (name, info) in &line.node_run_infos {
        println!("   {} -> {:?}", name, info.status);
        if let Some(error) = &info.error {
            println!("      {}: {}", error.code, error.message);
        }
    }
    if !line.output.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (name, value) in &line.output {
            println!("   {name}: {value}");
        }
    }

    if graph.has_aggregation_nodes() && line.run_info.status == Status::Completed {
        let flow_input_lists = inputs
            .into_iter()
            .map(|(name, value)| (name, Value::Array(vec![value])))
            .collect();
        let aggregation_inputs = line
            .aggregation_inputs
            .into_iter()
            .map(|(name, value)| (name, Value::Array(vec![value])))
            .collect();
        let aggregation = scheduler
            .exec_aggregation(flow_input_lists, aggregation_inputs, &root_run_id, cancellation)
            .await;
        if !aggregation.output.is_empty() {
            println!();
            println!("📤 Aggregation outputs:");
            for (name, value) in &aggregation.output {
                println!("   {name}: {value}");
            }
        }
    }
    Ok(())
}

fn parse_mappings(raw: &[String]) -> Result<InputMapping> {
    let mut mapping = InputMapping::new();
    for entry in raw {
        let (input, expr) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("mapping '{entry}' is not INPUT=EXPR"))?;
        mapping = mapping.with(input, expr);
    }
    Ok(mapping)
}

fn load_rows(data: &PathBuf) -> Result<Vec<BTreeMap<String, Value>>> {
    let text = std::fs::read_to_string(data)
        .with_context(|| format!("reading {}", data.display()))?;
    let mut rows = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let json: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("parsing row at line {}", number + 1))?;
        match Value::from(json) {
            Value::Object(map) => rows.push(map),
            _ => return Err(anyhow!("row at line {} is not a JSON object", number + 1)),
        }
    }
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    file: PathBuf,
    data: PathBuf,
    mappings: Vec<String>,
    workers: usize,
    line_timeout: u64,
    batch_timeout: Option<u64>,
    resume_from: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let graph = load_flow(&file)?;
    let rows = load_rows(&data)?;
    let mapping = parse_mappings(&mappings)?;
    let resume = match resume_from {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let prior: flowruntime::BatchResult =
                serde_json::from_str(&text).context("parsing prior result")?;
            Some(ResumeManifest::from_result(&prior))
        }
        None => None,
    };

    let config = BatchConfig {
        worker_count: workers,
        line_timeout: Duration::from_secs(line_timeout),
        batch_timeout: batch_timeout.map(Duration::from_secs),
        ..BatchConfig::default()
    };
    let registry = ToolRegistry::builtins();
    let engine = Arc::new(BatchEngine::new(
        graph,
        &registry,
        Arc::new(NoopStorage),
        config,
    ));

    let printer = spawn_event_printer(engine.events());
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("🛑 Cancel requested");
                engine.cancel();
            }
        });
    }

    let result = engine.run(rows, &mapping, resume.as_ref()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();

    println!();
    println!("📊 Batch summary:");
    println!("   Run id: {}", result.root_run_id);
    println!("   Status: {:?}", result.status);
    println!(
        "   Lines: {} completed / {} failed / {} total",
        result.completed_lines, result.failed_lines, result.total_lines
    );
    if !result.failed_line_indexes.is_empty() {
        println!("   Failed rows: {:?}", result.failed_line_indexes);
    }
    if !result.usage.is_empty() {
        println!("   Usage: {:?}", result.usage);
    }
    if !result.metrics.is_empty() {
        println!("   Metrics: {:?}", result.metrics);
    }

    let json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output, json)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("💾 Result written to {}", output.display());
    Ok(())
}

fn list_tools() {
    println!("📦 Available tools:");
    let registry = ToolRegistry::builtins();
    for name in registry.names() {
        println!("  • {name}");
    }
}
