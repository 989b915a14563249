use flowcore::{
    ApiCall, LineRunInfo, NodeError, NodeRunInfo, RunError, RunStorage, Status, Value, USAGE_KEYS,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Bookkeeping of execution records and status.
///
/// Record maps are append/update-only per run id; every node run owns a
/// distinct id, so concurrent workers never contend on the same entry.
/// Cheap to clone: all clones share the same maps and storage handle.
#[derive(Clone)]
pub struct RunTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    storage: Arc<dyn RunStorage>,
    node_runs: Mutex<HashMap<String, NodeRunInfo>>,
    line_runs: Mutex<HashMap<String, LineRunInfo>>,
}

impl RunTracker {
    pub fn new(storage: Arc<dyn RunStorage>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                storage,
                node_runs: Mutex::new(HashMap::new()),
                line_runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a Running line record and persist it immediately so
    /// in-progress rows are observable.
    pub fn start_line_run(
        &self,
        run_id: &str,
        root_run_id: &str,
        index: Option<usize>,
        inputs: BTreeMap<String, Value>,
    ) -> LineRunInfo {
        let mut info = LineRunInfo::running(run_id, root_run_id, index);
        info.inputs = Some(inputs);
        self.persist_line(&info);
        self.inner
            .line_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        info
    }

    /// Create a Running node record and persist it immediately.
    pub fn start_node_run(
        &self,
        node: &str,
        run_id: &str,
        line_run_id: &str,
        index: Option<usize>,
        inputs: BTreeMap<String, Value>,
    ) -> NodeRunInfo {
        let mut info = NodeRunInfo::running(node, run_id, line_run_id, index);
        info.inputs = Some(inputs);
        self.persist_node(&info);
        self.inner
            .node_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        info
    }

    /// Record a node that was skipped without invocation. Terminal from
    /// the start.
    pub fn bypass_node_run(
        &self,
        node: &str,
        run_id: &str,
        line_run_id: &str,
        index: Option<usize>,
    ) -> NodeRunInfo {
        let mut info = NodeRunInfo::running(node, run_id, line_run_id, index);
        info.status = Status::Bypassed;
        info.end_time = Some(Utc::now());
        self.persist_node(&info);
        self.inner
            .node_runs
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        info
    }

    /// Finalize a node record exactly once: set the terminal status,
    /// attach traces, aggregate usage counters, compute the duration,
    /// and persist. A record that is already terminal is left untouched.
    pub fn end_node_run(
        &self,
        run_id: &str,
        result: Result<Value, NodeError>,
        traces: Vec<ApiCall>,
    ) -> Option<NodeRunInfo> {
        let mut runs = self.inner.node_runs.lock().unwrap();
        let info = runs.get_mut(run_id)?;
        if info.status.is_terminated() {
            return Some(info.clone());
        }
        match result {
            Ok(output) => {
                info.status = Status::Completed;
                info.output = Some(self.ensure_serializable(output, &info.node));
            }
            Err(err) => {
                info.status = match err {
                    NodeError::Canceled { .. } => Status::Canceled,
                    _ => Status::Failed,
                };
                info.error = Some(RunError::from(&err));
            }
        }
        info.end_time = Some(Utc::now());
        info.system_metrics.duration_ms =
            (Utc::now() - info.start_time).num_milliseconds().max(0) as u64;
        info.system_metrics.usage = collect_usage(&traces);
        info.api_calls = traces;
        let snapshot = info.clone();
        drop(runs);
        self.persist_node(&snapshot);
        Some(snapshot)
    }

    /// Finalize a line record: roll child node traces and usage counters
    /// up, set the terminal status and duration, persist.
    pub fn end_line_run(
        &self,
        run_id: &str,
        output: Option<Value>,
        error: Option<RunError>,
        status: Status,
    ) -> Option<LineRunInfo> {
        let children = self.node_runs_for_line(run_id);
        let mut runs = self.inner.line_runs.lock().unwrap();
        let info = runs.get_mut(run_id)?;
        if info.status.is_terminated() {
            return Some(info.clone());
        }
        info.status = status;
        info.output = output.map(|v| self.ensure_serializable(v, "flow output"));
        info.error = error;
        info.end_time = Some(Utc::now());
        info.system_metrics.duration_ms =
            (Utc::now() - info.start_time).num_milliseconds().max(0) as u64;
        for child in &children {
            info.system_metrics.merge_usage(&child.system_metrics.usage);
            info.api_calls.extend(child.api_calls.iter().cloned());
        }
        let snapshot = info.clone();
        drop(runs);
        self.persist_line(&snapshot);
        Some(snapshot)
    }

    /// Sweep still-Running node records of a line into Canceled.
    pub fn cancel_node_runs(&self, line_run_id: &str, reason: &str) {
        let canceled: Vec<NodeRunInfo> = {
            let mut runs = self.inner.node_runs.lock().unwrap();
            runs.values_mut()
                .filter(|info| info.line_run_id == line_run_id && info.status == Status::Running)
                .map(|info| {
                    info.status = Status::Canceled;
                    info.error = Some(RunError::from(&NodeError::Canceled {
                        node: info.node.clone(),
                        reason: reason.to_string(),
                    }));
                    info.end_time = Some(Utc::now());
                    info.clone()
                })
                .collect()
        };
        for info in &canceled {
            self.persist_node(info);
        }
    }

    pub fn node_runs_for_line(&self, line_run_id: &str) -> Vec<NodeRunInfo> {
        self.inner
            .node_runs
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.line_run_id == line_run_id)
            .cloned()
            .collect()
    }

    pub fn get_node_run(&self, run_id: &str) -> Option<NodeRunInfo> {
        self.inner.node_runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn get_line_run(&self, run_id: &str) -> Option<LineRunInfo> {
        self.inner.line_runs.lock().unwrap().get(run_id).cloned()
    }

    /// Per-node completed/failed/bypassed counts and per-flow line
    /// counts for progress reporting.
    pub fn status_summary(&self, root_run_id: &str) -> BTreeMap<String, u64> {
        let mut summary = BTreeMap::new();
        let line_ids: Vec<String> = {
            let lines = self.inner.line_runs.lock().unwrap();
            lines
                .values()
                .filter(|info| info.root_run_id == root_run_id)
                .map(|info| info.run_id.clone())
                .collect()
        };
        {
            let nodes = self.inner.node_runs.lock().unwrap();
            for info in nodes.values() {
                if !line_ids.contains(&info.line_run_id) && info.line_run_id != root_run_id {
                    continue;
                }
                match info.index {
                    Some(_) => {
                        let bucket = match info.status {
                            Status::Completed => "completed",
                            Status::Failed => "failed",
                            Status::Bypassed => "bypassed",
                            _ => continue,
                        };
                        let key = format!("nodes.{}.{}", info.node, bucket);
                        *summary.entry(key).or_insert(0) += 1;
                    }
                    // Aggregation nodes run once per batch; report 0/1.
                    None => {
                        let key = format!("nodes.{}.completed", info.node);
                        let value = u64::from(info.status == Status::Completed);
                        summary.insert(key, value);
                    }
                }
            }
        }
        let lines = self.inner.line_runs.lock().unwrap();
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut canceled = 0u64;
        for info in lines
            .values()
            .filter(|info| info.root_run_id == root_run_id && info.run_id != root_run_id)
        {
            match info.status {
                Status::Completed => completed += 1,
                Status::Failed => failed += 1,
                Status::Canceled => canceled += 1,
                _ => {}
            }
        }
        summary.insert("lines.completed".to_string(), completed);
        summary.insert("lines.failed".to_string(), failed);
        summary.insert("lines.canceled".to_string(), canceled);
        summary
    }

    pub fn persist_status_summary(&self, summary: &BTreeMap<String, u64>, root_run_id: &str) {
        if let Err(e) = self
            .inner
            .storage
            .persist_status_summary(summary, root_run_id)
        {
            tracing::warn!(error = %e, "failed to persist status summary");
        }
    }

    /// Outputs that would not survive a JSON round trip are stored as
    /// their string rendering with a warning; this never fails the run.
    fn ensure_serializable(&self, value: Value, context: &str) -> Value {
        if value.is_json_safe() {
            value
        } else {
            tracing::warn!(
                context = %context,
                "output is not JSON serializable, storing its string form"
            );
            Value::String(value.to_string())
        }
    }

    fn persist_node(&self, info: &NodeRunInfo) {
        if let Err(e) = self.inner.storage.persist_node_run(info) {
            tracing::warn!(node = %info.node, error = %e, "failed to persist node run");
        }
    }

    fn persist_line(&self, info: &LineRunInfo) {
        if let Err(e) = self.inner.storage.persist_line_run(info) {
            tracing::warn!(run_id = %info.run_id, error = %e, "failed to persist line run");
        }
    }
}

/// Sum the known usage counters across a trace tree.
pub fn collect_usage(traces: &[ApiCall]) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    fn walk(call: &ApiCall, totals: &mut BTreeMap<String, u64>) {
        for key in USAGE_KEYS {
            if let Some(count) = call.usage.get(key) {
                *totals.entry(key.to_string()).or_insert(0) += count;
            }
        }
        for child in &call.children {
            walk(child, totals);
        }
    }
    for call in traces {
        walk(call, &mut totals);
    }
    totals
}
