use crate::scheduler::{LineResult, NodeScheduler};
use flowcore::{BatchError, LineRunInfo, NodeRunInfo, RunError, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Worker supervision settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent rows across the batch.
    pub worker_count: usize,
    /// How often a worker reports liveness.
    pub heartbeat_interval: Duration,
    /// A worker silent for this long is presumed hung.
    pub heartbeat_timeout: Duration,
    /// How long a replaced worker gets to confirm termination.
    pub termination_timeout: Duration,
    /// How many times a row is retried on a fresh worker after a crash.
    pub max_respawns: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            termination_timeout: Duration::from_secs(10),
            max_respawns: 1,
        }
    }
}

/// One input row queued for execution.
#[derive(Debug, Clone)]
pub struct RowTask {
    pub index: usize,
    pub inputs: BTreeMap<String, Value>,
}

/// What the pool hands back: one result per finished row, plus how the
/// run ended. Rows missing from `results` were never finished (only
/// possible after cancellation).
#[derive(Debug)]
pub struct PoolRun {
    pub results: BTreeMap<usize, LineResult>,
    pub timed_out: bool,
    pub canceled: bool,
}

enum WorkerEvent {
    Heartbeat {
        worker_id: usize,
    },
    Started {
        worker_id: usize,
        index: usize,
    },
    Finished {
        worker_id: usize,
        index: usize,
        result: Box<LineResult>,
    },
}

struct WorkerSlot {
    join: JoinHandle<()>,
    task_tx: mpsc::Sender<RowTask>,
    busy: Option<RowTask>,
    last_heartbeat: Instant,
}

/// A fixed-size set of supervised row workers. Each worker is a task
/// pulling rows off its own single-slot queue; the supervisor watches
/// heartbeats and join state, replaces crashed or hung workers, and
/// retries their rows up to `max_respawns` times.
pub struct WorkerPool {
    scheduler: Arc<NodeScheduler>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<NodeScheduler>, config: PoolConfig) -> Self {
        Self { scheduler, config }
    }

    /// Drive every row to a terminal record. Returns Err only when the
    /// pool cannot start at all; row-level trouble is folded into the
    /// per-row results.
    pub async fn run_rows(
        &self,
        rows: Vec<RowTask>,
        root_run_id: &str,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Result<PoolRun, BatchError> {
        let deadline = Instant::now() + timeout;
        if self.config.worker_count == 0 {
            return Err(BatchError::PoolStartFailure(
                "worker_count must be at least one".to_string(),
            ));
        }

        let total = rows.len();
        let mut queue: VecDeque<RowTask> = rows.into();
        let mut results: BTreeMap<usize, LineResult> = BTreeMap::new();
        let mut respawns: HashMap<usize, usize> = HashMap::new();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut workers: HashMap<usize, WorkerSlot> = HashMap::new();
        let mut next_worker_id = 0usize;
        for _ in 0..self.config.worker_count {
            let slot = self.spawn_worker(next_worker_id, root_run_id, &event_tx, &cancellation);
            workers.insert(next_worker_id, slot);
            next_worker_id += 1;
        }
        tracing::info!(workers = workers.len(), rows = total, "worker pool started");

        let mut monitor = tokio::time::interval(self.config.heartbeat_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timed_out = false;
        let mut canceled = false;

        while results.len() < total {
            // Hand queued rows to idle workers.
            for slot in workers.values_mut() {
                if slot.busy.is_some() {
                    continue;
                }
                let Some(task) = queue.pop_front() else {
                    break;
                };
                match slot.task_tx.try_send(task.clone()) {
                    Ok(()) => slot.busy = Some(task),
                    Err(_) => queue.push_front(task),
                }
            }

            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &mut workers, &mut results);
                }
                _ = monitor.tick() => {
                    let suspects = self.find_suspects(&workers);
                    for worker_id in suspects {
                        self.replace_worker(
                            worker_id,
                            &mut workers,
                            &mut next_worker_id,
                            &mut queue,
                            &mut results,
                            &mut respawns,
                            root_run_id,
                            &event_tx,
                            &cancellation,
                        )
                        .await;
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
            self.fail_pending_rows(&mut queue, &workers, &mut results, root_run_id, timeout);
        }
        if canceled {
            // In-flight rows observe the token and come back Canceled;
            // give them a bounded window to report.
            let drain_deadline = Instant::now() + self.config.termination_timeout;
            while workers.values().any(|s| s.busy.is_some()) {
                match tokio::time::timeout_at(drain_deadline, event_rx.recv()).await {
                    Ok(Some(event)) => self.handle_event(event, &mut workers, &mut results),
                    _ => break,
                }
            }
        }

        for slot in workers.values() {
            slot.join.abort();
        }

        Ok(PoolRun {
            results,
            timed_out,
            canceled,
        })
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        root_run_id: &str,
        event_tx: &mpsc::UnboundedSender<WorkerEvent>,
        cancellation: &CancellationToken,
    ) -> WorkerSlot {
        let (task_tx, task_rx) = mpsc::channel(1);
        let join = tokio::spawn(worker_loop(
            worker_id,
            self.scheduler.clone(),
            root_run_id.to_string(),
            task_rx,
            event_tx.clone(),
            self.config.heartbeat_interval,
            cancellation.clone(),
        ));
        WorkerSlot {
            join,
            task_tx,
            busy: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_event(
        &self,
        event: WorkerEvent,
        workers: &mut HashMap<usize, WorkerSlot>,
        results: &mut BTreeMap<usize, LineResult>,
    ) {
        match event {
            WorkerEvent::Heartbeat { worker_id } => {
                if let Some(slot) = workers.get_mut(&worker_id) {
                    slot.last_heartbeat = Instant::now();
                }
            }
            WorkerEvent::Started { worker_id, index } => {
                tracing::debug!(worker_id, index, "row started");
                if let Some(slot) = workers.get_mut(&worker_id) {
                    slot.last_heartbeat = Instant::now();
                }
            }
            WorkerEvent::Finished {
                worker_id,
                index,
                result,
            } => {
                if let Some(slot) = workers.get_mut(&worker_id) {
                    slot.last_heartbeat = Instant::now();
                    slot.busy = None;
                }
                results.insert(index, *result);
            }
        }
    }

    /// Workers that are busy but either exited (panic) or went silent
    /// past the heartbeat timeout.
    fn find_suspects(&self, workers: &HashMap<usize, WorkerSlot>) -> Vec<usize> {
        workers
            .iter()
            .filter(|(_, slot)| {
                slot.busy.is_some()
                    && (slot.join.is_finished()
                        || slot.last_heartbeat.elapsed() > self.config.heartbeat_timeout)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tear down one crashed or hung worker, spawn a replacement, and
    /// requeue or fail its row.
    #[allow(clippy::too_many_arguments)]
    async fn replace_worker(
        &self,
        worker_id: usize,
        workers: &mut HashMap<usize, WorkerSlot>,
        next_worker_id: &mut usize,
        queue: &mut VecDeque<RowTask>,
        results: &mut BTreeMap<usize, LineResult>,
        respawns: &mut HashMap<usize, usize>,
        root_run_id: &str,
        event_tx: &mpsc::UnboundedSender<WorkerEvent>,
        cancellation: &CancellationToken,
    ) {
        let Some(mut slot) = workers.remove(&worker_id) else {
            return;
        };
        let Some(task) = slot.busy.take() else {
            workers.insert(worker_id, slot);
            return;
        };
        let index = task.index;
        tracing::warn!(worker_id, index, "worker crashed or hung, replacing it");

        slot.join.abort();
        let confirmed = tokio::time::timeout(self.config.termination_timeout, &mut slot.join)
            .await
            .is_ok();

        let replacement = self.spawn_worker(*next_worker_id, root_run_id, event_tx, cancellation);
        workers.insert(*next_worker_id, replacement);
        *next_worker_id += 1;

        if !confirmed {
            let err = BatchError::WorkerTerminationTimeout {
                worker_id,
                timeout_secs: self.config.termination_timeout.as_secs(),
            };
            tracing::error!(worker_id, index, "{err}");
            results.insert(
                index,
                self.failed_line_result(index, root_run_id, RunError::from(&err)),
            );
            return;
        }

        let attempts = respawns.entry(index).or_insert(0);
        if *attempts < self.config.max_respawns {
            *attempts += 1;
            tracing::info!(index, attempt = *attempts, "requeueing row on a fresh worker");
            queue.push_back(task);
        } else {
            let err = BatchError::WorkerCrashed {
                worker_id,
                index,
                message: "worker stopped responding".to_string(),
            };
            results.insert(
                index,
                self.failed_line_result(index, root_run_id, RunError::from(&err)),
            );
        }
    }

    /// After the batch deadline: every row without a result gets a
    /// terminal Failed record instead of being dropped.
    fn fail_pending_rows(
        &self,
        queue: &mut VecDeque<RowTask>,
        workers: &HashMap<usize, WorkerSlot>,
        results: &mut BTreeMap<usize, LineResult>,
        root_run_id: &str,
        timeout: Duration,
    ) {
        let mut pending: Vec<usize> = queue.drain(..).map(|t| t.index).collect();
        pending.extend(
            workers
                .values()
                .filter_map(|slot| slot.busy.as_ref().map(|t| t.index)),
        );
        pending.sort_unstable();
        if pending.is_empty() {
            return;
        }
        tracing::warn!(?pending, "batch deadline expired, failing unfinished rows");
        let err = BatchError::BatchTimeout {
            timeout_secs: timeout.as_secs(),
            pending: pending.clone(),
        };
        let run_error = RunError::from(&err);
        for index in pending {
            results.insert(
                index,
                self.failed_line_result(index, root_run_id, run_error.clone()),
            );
        }
    }

    /// A synthetic terminal result for a row the flow never finished.
    /// Partial node records from the dead attempt are kept as-is.
    fn failed_line_result(
        &self,
        index: usize,
        root_run_id: &str,
        error: RunError,
    ) -> LineResult {
        let line_run_id = format!("{root_run_id}_{index}");
        let run_info = LineRunInfo::failed(&line_run_id, root_run_id, Some(index), error);
        let node_run_infos: BTreeMap<String, NodeRunInfo> = self
            .scheduler
            .tracker()
            .node_runs_for_line(&line_run_id)
            .into_iter()
            .map(|info| (info.node.clone(), info))
            .collect();
        let aggregation_inputs = self
            .scheduler
            .graph()
            .aggregation_input_nodes()
            .into_iter()
            .map(|name| (name.to_string(), Value::Null))
            .collect();
        LineResult {
            output: BTreeMap::new(),
            aggregation_inputs,
            run_info,
            node_run_infos,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    scheduler: Arc<NodeScheduler>,
    root_run_id: String,
    mut tasks: mpsc::Receiver<RowTask>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    heartbeat_interval: Duration,
    cancellation: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            task = tasks.recv() => {
                let Some(task) = task else { break };
                let index = task.index;
                let _ = events.send(WorkerEvent::Started { worker_id, index });
                let exec = scheduler.exec_line(
                    task.inputs,
                    Some(index),
                    &root_run_id,
                    cancellation.child_token(),
                );
                tokio::pin!(exec);
                // Keep heartbeating while the row runs so a long row is
                // distinguishable from a hung worker.
                let result = loop {
                    tokio::select! {
                        result = &mut exec => break result,
                        _ = heartbeat.tick() => {
                            let _ = events.send(WorkerEvent::Heartbeat { worker_id });
                        }
                    }
                };
                let _ = events.send(WorkerEvent::Finished {
                    worker_id,
                    index,
                    result: Box::new(result),
                });
            }
            _ = heartbeat.tick() => {
                let _ = events.send(WorkerEvent::Heartbeat { worker_id });
            }
        }
    }
}
