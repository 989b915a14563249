use crate::pool::{PoolConfig, RowTask, WorkerPool};
use crate::scheduler::{NodeScheduler, SchedulerConfig};
use crate::tracker::RunTracker;
use chrono::{DateTime, Utc};
use flowcore::{
    EventBus, ExecutionEvent, FlowGraph, ResolveError, RunError, RunStorage, Status, ToolResolver,
    Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Batch-level settings layered over the per-row scheduler settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Concurrent rows.
    pub worker_count: usize,
    /// Concurrent nodes within one row.
    pub node_concurrency: usize,
    /// Deadline per row.
    pub line_timeout: Duration,
    /// Deadline for the whole batch; None means no batch deadline.
    pub batch_timeout: Option<Duration>,
    /// Deadline for the aggregation pass; None means `line_timeout`.
    pub aggregation_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a worker is presumed hung.
    pub heartbeat_misses: u32,
    /// How long a replaced worker gets to confirm termination.
    pub termination_timeout: Duration,
    /// Retries per row after a worker crash.
    pub max_respawns: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            node_concurrency: 16,
            line_timeout: Duration::from_secs(600),
            batch_timeout: None,
            aggregation_timeout: None,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_misses: 6,
            termination_timeout: Duration::from_secs(10),
            max_respawns: 1,
        }
    }
}

impl BatchConfig {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            node_concurrency: self.node_concurrency,
            line_timeout: self.line_timeout,
            aggregation_timeout: self.aggregation_timeout.unwrap_or(self.line_timeout),
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_count: self.worker_count,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_interval * self.heartbeat_misses.max(1),
            termination_timeout: self.termination_timeout,
            max_respawns: self.max_respawns,
        }
    }

    fn effective_batch_timeout(&self) -> Duration {
        // A year stands in for "no deadline"; the select arm still
        // needs an instant to sleep toward.
        self.batch_timeout
            .unwrap_or(Duration::from_secs(365 * 24 * 3600))
    }
}

/// Maps row columns onto declared flow inputs. An entry is either
/// `${data.<column>}` or a literal applied to every row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputMapping {
    entries: BTreeMap<String, String>,
}

impl InputMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, input: impl Into<String>, expr: impl Into<String>) -> Self {
        self.entries.insert(input.into(), expr.into());
        self
    }

    /// Resolve one flow input against a row. None when the mapping
    /// references a column the row does not have.
    fn apply(&self, input: &str, row: &BTreeMap<String, Value>) -> Option<Value> {
        match self.entries.get(input) {
            None => row.get(input).cloned(),
            Some(expr) => match expr
                .strip_prefix("${data.")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(column) => row.get(column).cloned(),
                None => Some(Value::String(expr.clone())),
            },
        }
    }
}

/// One row of a finished batch, index-keyed and serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLineSummary {
    pub index: usize,
    pub status: Status,
    pub inputs: BTreeMap<String, Value>,
    pub output: BTreeMap<String, Value>,
    pub aggregation_inputs: BTreeMap<String, Value>,
    pub usage: BTreeMap<String, u64>,
    pub error: Option<RunError>,
}

/// What a batch run produces. Serializable so a later run can resume
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub root_run_id: String,
    pub status: Status,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub failed_lines: usize,
    pub failed_line_indexes: Vec<usize>,
    /// Per-row summaries in input row order.
    pub lines: Vec<BatchLineSummary>,
    pub aggregation_output: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    pub usage: BTreeMap<String, u64>,
    pub node_status: BTreeMap<String, u64>,
    pub error: Option<RunError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Completed rows carried over from a prior run. Rows present here are
/// not re-dispatched; their outputs and aggregation inputs merge
/// unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeManifest {
    pub root_run_id: String,
    pub lines: BTreeMap<usize, ResumeLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeLine {
    pub inputs: BTreeMap<String, Value>,
    pub output: BTreeMap<String, Value>,
    pub aggregation_inputs: BTreeMap<String, Value>,
    pub usage: BTreeMap<String, u64>,
}

impl ResumeManifest {
    /// Only Completed lines carry over; failed and canceled rows run
    /// again.
    pub fn from_result(result: &BatchResult) -> Self {
        let lines = result
            .lines
            .iter()
            .filter(|line| line.status == Status::Completed)
            .map(|line| {
                (
                    line.index,
                    ResumeLine {
                        inputs: line.inputs.clone(),
                        output: line.output.clone(),
                        aggregation_inputs: line.aggregation_inputs.clone(),
                        usage: line.usage.clone(),
                    },
                )
            })
            .collect();
        Self {
            root_run_id: result.root_run_id.clone(),
            lines,
        }
    }
}

/// Runs a validated flow over a row set: maps inputs, dispatches rows to
/// the worker pool, runs the aggregation pass, and folds everything into
/// one serializable result. After construction nothing here raises; all
/// failure is captured in records.
pub struct BatchEngine {
    graph: Arc<FlowGraph>,
    scheduler: Result<Arc<NodeScheduler>, ResolveError>,
    tracker: RunTracker,
    events: EventBus,
    config: BatchConfig,
    cancellation: CancellationToken,
}

impl BatchEngine {
    /// A resolver failure is not surfaced here: the engine still
    /// constructs, and every row of the next run is recorded Failed
    /// with the resolution error.
    pub fn new(
        graph: FlowGraph,
        resolver: &dyn ToolResolver,
        storage: Arc<dyn RunStorage>,
        config: BatchConfig,
    ) -> Self {
        let graph = Arc::new(graph);
        let tracker = RunTracker::new(storage);
        let events = EventBus::default();
        let scheduler = NodeScheduler::new(
            graph.clone(),
            resolver,
            tracker.clone(),
            events.clone(),
            config.scheduler_config(),
        )
        .map(Arc::new);
        if let Err(e) = &scheduler {
            tracing::error!(error = %e, "tool resolution failed, all rows will be failed");
        }
        Self {
            graph,
            scheduler,
            tracker,
            events,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Request cooperative cancellation. Completed line results are
    /// retained; the batch ends Canceled.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn run(
        &self,
        rows: Vec<BTreeMap<String, Value>>,
        mapping: &InputMapping,
        resume: Option<&ResumeManifest>,
    ) -> BatchResult {
        let start_time = Utc::now();
        let root_run_id = Uuid::new_v4().to_string();
        let total_lines = rows.len();
        self.events.emit(ExecutionEvent::BatchStarted {
            root_run_id: root_run_id.clone(),
            total_lines,
            timestamp: Utc::now(),
        });
        tracing::info!(root_run_id = %root_run_id, rows = total_lines, "batch started");

        let scheduler = match &self.scheduler {
            Ok(scheduler) => scheduler.clone(),
            Err(resolve_error) => {
                return self.finish(self.all_rows_failed(
                    root_run_id,
                    rows,
                    RunError::from(resolve_error),
                    start_time,
                ));
            }
        };

        // Partition rows: carried over from the manifest, failed at
        // mapping time, or queued for execution.
        let mut summaries: BTreeMap<usize, BatchLineSummary> = BTreeMap::new();
        let mut tasks: Vec<RowTask> = Vec::new();
        let mut resumed = 0usize;
        for (index, row) in rows.into_iter().enumerate() {
            if let Some(line) = resume.and_then(|m| m.lines.get(&index)) {
                summaries.insert(
                    index,
                    BatchLineSummary {
                        index,
                        status: Status::Completed,
                        inputs: line.inputs.clone(),
                        output: line.output.clone(),
                        aggregation_inputs: line.aggregation_inputs.clone(),
                        usage: line.usage.clone(),
                        error: None,
                    },
                );
                resumed += 1;
                continue;
            }
            match self.resolve_row_inputs(&row, mapping) {
                Ok(inputs) => tasks.push(RowTask { index, inputs }),
                Err(error) => {
                    // Recorded through the tracker like any other
                    // failed row, just without dispatching.
                    let line_run_id = format!("{root_run_id}_{index}");
                    self.tracker
                        .start_line_run(&line_run_id, &root_run_id, Some(index), row.clone());
                    self.tracker.end_line_run(
                        &line_run_id,
                        None,
                        Some(error.clone()),
                        Status::Failed,
                    );
                    summaries.insert(
                        index,
                        BatchLineSummary {
                            index,
                            status: Status::Failed,
                            inputs: row,
                            output: BTreeMap::new(),
                            aggregation_inputs: BTreeMap::new(),
                            usage: BTreeMap::new(),
                            error: Some(error),
                        },
                    );
                }
            }
        }
        if resumed > 0 {
            tracing::info!(resumed, "skipping rows completed by the previous run");
        }

        // Execution inputs are kept for the aggregation pass, which
        // sees flow inputs as across-row lists.
        let task_inputs: BTreeMap<usize, BTreeMap<String, Value>> = tasks
            .iter()
            .map(|t| (t.index, t.inputs.clone()))
            .collect();

        let pool = WorkerPool::new(scheduler.clone(), self.config.pool_config());
        let pool_run = match pool
            .run_rows(
                tasks,
                &root_run_id,
                self.config.effective_batch_timeout(),
                self.cancellation.child_token(),
            )
            .await
        {
            Ok(run) => run,
            Err(pool_error) => {
                let error = RunError::from(&pool_error);
                let mut result = self.collect(
                    root_run_id,
                    total_lines,
                    summaries,
                    BTreeMap::new(),
                    BTreeMap::new(),
                    start_time,
                );
                result.status = Status::Failed;
                result.error = Some(error);
                return self.finish(result);
            }
        };

        for (index, line) in &pool_run.results {
            let inputs = task_inputs.get(index).cloned().unwrap_or_default();
            summaries.insert(
                *index,
                BatchLineSummary {
                    index: *index,
                    status: line.run_info.status,
                    inputs,
                    output: line.output.clone(),
                    aggregation_inputs: line.aggregation_inputs.clone(),
                    usage: line.run_info.system_metrics.usage.clone(),
                    error: line.run_info.error.clone(),
                },
            );
        }

        // Aggregation still runs after a batch timeout, over whatever
        // completed; it is skipped entirely on cancel.
        let (aggregation_output, metrics) = if pool_run.canceled {
            (BTreeMap::new(), BTreeMap::new())
        } else {
            self.run_aggregation(&scheduler, &summaries, &root_run_id)
                .await
        };

        let mut result = self.collect(
            root_run_id,
            total_lines,
            summaries,
            aggregation_output,
            metrics,
            start_time,
        );
        if pool_run.canceled {
            result.status = Status::Canceled;
        }
        self.finish(result)
    }

    /// Map one row onto the declared flow inputs, apply defaults, then
    /// coerce to each input's declared kind.
    fn resolve_row_inputs(
        &self,
        row: &BTreeMap<String, Value>,
        mapping: &InputMapping,
    ) -> Result<BTreeMap<String, Value>, RunError> {
        let mut inputs = BTreeMap::new();
        for (name, decl) in &self.graph.inputs {
            let value = match mapping.apply(name, row) {
                Some(value) => value,
                None => match &decl.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(RunError::new(
                            "InputMappingError",
                            format!("no row column or default for flow input '{name}'"),
                        ));
                    }
                },
            };
            let coerced = decl.kind.coerce(value).map_err(|message| {
                RunError::new(
                    "InputTypeError",
                    format!("flow input '{name}': {message}"),
                )
            })?;
            inputs.insert(name.clone(), coerced);
        }
        Ok(inputs)
    }

    /// Build the aggregation call: succeeded rows only, index-aligned.
    /// Rows that failed are omitted from every list so positions stay
    /// consistent across flow inputs and node outputs.
    async fn run_aggregation(
        &self,
        scheduler: &Arc<NodeScheduler>,
        summaries: &BTreeMap<usize, BatchLineSummary>,
        root_run_id: &str,
    ) -> (BTreeMap<String, Value>, BTreeMap<String, f64>) {
        if !self.graph.has_aggregation_nodes() {
            return (BTreeMap::new(), BTreeMap::new());
        }
        let succeeded: BTreeSet<usize> = summaries
            .values()
            .filter(|s| s.status == Status::Completed)
            .map(|s| s.index)
            .collect();

        let mut flow_input_lists: BTreeMap<String, Value> = BTreeMap::new();
        for name in self.graph.inputs.keys() {
            let list: Vec<Value> = succeeded
                .iter()
                .map(|i| {
                    summaries[i]
                        .inputs
                        .get(name)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            flow_input_lists.insert(name.clone(), Value::Array(list));
        }
        let mut aggregation_inputs: BTreeMap<String, Value> = BTreeMap::new();
        for node in self.graph.aggregation_input_nodes() {
            let list: Vec<Value> = succeeded
                .iter()
                .map(|i| {
                    summaries[i]
                        .aggregation_inputs
                        .get(node)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            aggregation_inputs.insert(node.to_string(), Value::Array(list));
        }

        let result = scheduler
            .exec_aggregation(
                flow_input_lists,
                aggregation_inputs,
                root_run_id,
                self.cancellation.child_token(),
            )
            .await;
        let failed: Vec<&String> = result
            .node_run_infos
            .iter()
            .filter(|(_, info)| info.status == Status::Failed)
            .map(|(name, _)| name)
            .collect();
        if !failed.is_empty() {
            tracing::warn!(nodes = ?failed, "aggregation nodes failed; their output is omitted");
        }
        (result.output, result.metrics)
    }

    /// Fold summaries into the final result and persist the status
    /// summary.
    fn collect(
        &self,
        root_run_id: String,
        total_lines: usize,
        summaries: BTreeMap<usize, BatchLineSummary>,
        aggregation_output: BTreeMap<String, Value>,
        metrics: BTreeMap<String, f64>,
        start_time: DateTime<Utc>,
    ) -> BatchResult {
        let mut usage: BTreeMap<String, u64> = BTreeMap::new();
        for line in summaries.values() {
            for (key, count) in &line.usage {
                *usage.entry(key.clone()).or_insert(0) += count;
            }
        }
        for info in self.tracker.node_runs_for_line(&root_run_id) {
            for (key, count) in &info.system_metrics.usage {
                *usage.entry(key.clone()).or_insert(0) += count;
            }
        }

        let failed_line_indexes: Vec<usize> = summaries
            .values()
            .filter(|s| s.status == Status::Failed)
            .map(|s| s.index)
            .collect();
        let completed_lines = summaries
            .values()
            .filter(|s| s.status == Status::Completed)
            .count();

        let node_status = self.tracker.status_summary(&root_run_id);
        self.tracker
            .persist_status_summary(&node_status, &root_run_id);

        BatchResult {
            root_run_id,
            status: Status::Completed,
            total_lines,
            completed_lines,
            failed_lines: failed_line_indexes.len(),
            failed_line_indexes,
            lines: summaries.into_values().collect(),
            aggregation_output,
            metrics,
            usage,
            node_status,
            error: None,
            start_time,
            end_time: Utc::now(),
        }
    }

    fn all_rows_failed(
        &self,
        root_run_id: String,
        rows: Vec<BTreeMap<String, Value>>,
        error: RunError,
        start_time: DateTime<Utc>,
    ) -> BatchResult {
        let summaries: BTreeMap<usize, BatchLineSummary> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                (
                    index,
                    BatchLineSummary {
                        index,
                        status: Status::Failed,
                        inputs: row,
                        output: BTreeMap::new(),
                        aggregation_inputs: BTreeMap::new(),
                        usage: BTreeMap::new(),
                        error: Some(error.clone()),
                    },
                )
            })
            .collect();
        let total = summaries.len();
        let mut result = self.collect(
            root_run_id,
            total,
            summaries,
            BTreeMap::new(),
            BTreeMap::new(),
            start_time,
        );
        result.status = Status::Failed;
        result.error = Some(error);
        result
    }

    fn finish(&self, result: BatchResult) -> BatchResult {
        self.events.emit(ExecutionEvent::BatchCompleted {
            root_run_id: result.root_run_id.clone(),
            status: result.status,
            duration_ms: (result.end_time - result.start_time).num_milliseconds().max(0) as u64,
            timestamp: Utc::now(),
        });
        tracing::info!(
            root_run_id = %result.root_run_id,
            status = ?result.status,
            completed = result.completed_lines,
            failed = result.failed_lines,
            "batch finished"
        );
        result
    }
}
