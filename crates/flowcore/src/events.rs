use crate::run_info::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Progress events emitted while a batch executes. Delivery is lossy by
/// design: the bus drops events for slow subscribers rather than stall
/// the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    BatchStarted {
        root_run_id: String,
        total_lines: usize,
        timestamp: DateTime<Utc>,
    },
    BatchCompleted {
        root_run_id: String,
        status: Status,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    LineStarted {
        root_run_id: String,
        index: Option<usize>,
        timestamp: DateTime<Utc>,
    },
    LineCompleted {
        root_run_id: String,
        index: Option<usize>,
        status: Status,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        line_run_id: String,
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        line_run_id: String,
        node: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        line_run_id: String,
        node: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeBypassed {
        line_run_id: String,
        node: String,
        timestamp: DateTime<Utc>,
    },
}

/// In-process broadcast bus for execution events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
