//! Execution runtime: per-row scheduling, run tracking, worker pool
//! supervision and the batch engine.

pub mod batch;
pub mod dag;
pub mod pool;
pub mod scheduler;
pub mod tracker;

pub use batch::{
    BatchConfig, BatchEngine, BatchLineSummary, BatchResult, InputMapping, ResumeLine,
    ResumeManifest,
};
pub use dag::DagManager;
pub use pool::{PoolConfig, PoolRun, RowTask, WorkerPool};
pub use scheduler::{
    AggregationResult, ExecutionStrategy, LineResult, NodeScheduler, SchedulerConfig,
};
pub use tracker::{collect_usage, RunTracker};
