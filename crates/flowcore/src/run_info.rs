use crate::error::RunError;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Run status state machine: Running transitions one way into one of the
/// terminal states and never back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
}

impl Status {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Bypassed | Status::Canceled
        )
    }
}

/// Usage counters aggregated across call traces.
pub const USAGE_KEYS: [&str; 3] = ["prompt_tokens", "completion_tokens", "total_tokens"];

/// One call made by a tool during a node run (an LLM request, an HTTP
/// request, ...). Traces nest: a call may carry child calls, and usage
/// counters are aggregated across the whole tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApiCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usage: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ApiCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, key: impl Into<String>, count: u64) -> Self {
        self.usage.insert(key.into(), count);
        self
    }

    pub fn finished(mut self) -> Self {
        self.end_time = Some(Utc::now());
        self
    }
}

/// Duration plus usage counters attached to a finalized record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usage: BTreeMap<String, u64>,
}

impl SystemMetrics {
    pub fn merge_usage(&mut self, other: &BTreeMap<String, u64>) {
        for (key, count) in other {
            *self.usage.entry(key.clone()).or_insert(0) += count;
        }
    }
}

/// Execution record of one node within one line. Created Running at
/// start, mutated only by its owning worker, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRunInfo {
    pub node: String,
    pub run_id: String,
    pub line_run_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Row index; None for aggregation nodes, which run once per batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_calls: Vec<ApiCall>,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
}

impl NodeRunInfo {
    pub fn running(
        node: impl Into<String>,
        run_id: impl Into<String>,
        line_run_id: impl Into<String>,
        index: Option<usize>,
    ) -> Self {
        Self {
            node: node.into(),
            run_id: run_id.into(),
            line_run_id: line_run_id.into(),
            status: Status::Running,
            inputs: None,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: Vec::new(),
            system_metrics: SystemMetrics::default(),
        }
    }
}

/// Execution record of one line (one input row through the whole flow).
/// Aggregates metrics from its child node records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineRunInfo {
    pub run_id: String,
    pub parent_run_id: String,
    pub root_run_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_calls: Vec<ApiCall>,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
}

impl LineRunInfo {
    pub fn running(
        run_id: impl Into<String>,
        root_run_id: impl Into<String>,
        index: Option<usize>,
    ) -> Self {
        let root = root_run_id.into();
        Self {
            run_id: run_id.into(),
            parent_run_id: root.clone(),
            root_run_id: root,
            status: Status::Running,
            inputs: None,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: Vec::new(),
            system_metrics: SystemMetrics::default(),
        }
    }

    /// Terminal Failed record built outside a scheduler, e.g. for a row
    /// whose worker crashed before returning a result.
    pub fn failed(
        run_id: impl Into<String>,
        root_run_id: impl Into<String>,
        index: Option<usize>,
        error: RunError,
    ) -> Self {
        let mut info = Self::running(run_id, root_run_id, index);
        info.status = Status::Failed;
        info.error = Some(error);
        info.end_time = Some(Utc::now());
        info
    }
}
