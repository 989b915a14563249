use crate::error::StorageError;
use crate::run_info::{LineRunInfo, NodeRunInfo};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Boundary for persisting execution records. Invoked at least once per
/// terminal state; callers treat failures as non-fatal (in-memory
/// results still flow onward).
pub trait RunStorage: Send + Sync {
    fn persist_node_run(&self, record: &NodeRunInfo) -> Result<(), StorageError>;
    fn persist_line_run(&self, record: &LineRunInfo) -> Result<(), StorageError>;
    fn persist_status_summary(
        &self,
        summary: &BTreeMap<String, u64>,
        root_run_id: &str,
    ) -> Result<(), StorageError>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopStorage;

impl RunStorage for NoopStorage {
    fn persist_node_run(&self, _record: &NodeRunInfo) -> Result<(), StorageError> {
        Ok(())
    }

    fn persist_line_run(&self, _record: &LineRunInfo) -> Result<(), StorageError> {
        Ok(())
    }

    fn persist_status_summary(
        &self,
        _summary: &BTreeMap<String, u64>,
        _root_run_id: &str,
    ) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Keeps the latest record per run id in memory. Used by tests and by
/// the resume path when no durable store is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    node_runs: Mutex<BTreeMap<String, NodeRunInfo>>,
    line_runs: Mutex<BTreeMap<String, LineRunInfo>>,
    summaries: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_runs(&self) -> Vec<NodeRunInfo> {
        self.node_runs.lock().unwrap().values().cloned().collect()
    }

    pub fn line_runs(&self) -> Vec<LineRunInfo> {
        self.line_runs.lock().unwrap().values().cloned().collect()
    }

    pub fn status_summary(&self, root_run_id: &str) -> Option<BTreeMap<String, u64>> {
        self.summaries.lock().unwrap().get(root_run_id).cloned()
    }
}

impl RunStorage for MemoryStorage {
    fn persist_node_run(&self, record: &NodeRunInfo) -> Result<(), StorageError> {
        self.node_runs
            .lock()
            .unwrap()
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn persist_line_run(&self, record: &LineRunInfo) -> Result<(), StorageError> {
        self.line_runs
            .lock()
            .unwrap()
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn persist_status_summary(
        &self,
        summary: &BTreeMap<String, u64>,
        root_run_id: &str,
    ) -> Result<(), StorageError> {
        self.summaries
            .lock()
            .unwrap()
            .insert(root_run_id.to_string(), summary.clone());
        Ok(())
    }
}
