//! Concurrent execution engine for chunked experiment work.
//!
//! The engine owns a fixed-size pool of workers that pull chunks from a
//! shared queue until it drains. Workers produce two out-of-band streams:
//! durable [`Record`]s sent to the coordinator's sink channel, and
//! [`WorkerMessage`] diagnostics relayed into structured logging. Failures
//! are isolated at the smallest sensible boundary:
//!
//! - a chunk whose manifest cannot serialize is reported and skipped,
//! - a worker that dies mid-chunk loses only that chunk's remaining items,
//! - a work item whose evaluation panics loses only that item.
//!
//! In every case the rest of the run proceeds, and whatever was durably
//! recorded before the failure stays valid for resumption.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::experiments::chunking::Chunk;
use crate::experiments::workitems::WorkItem;
use crate::transactions::{Record, WorkItemId};

/// Lifecycle of one engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Dispatching,
    Draining,
    Done,
    Aborted,
}

/// Out-of-band diagnostics emitted by workers.
///
/// These never enter the transaction log; the relay task turns them into
/// structured log events on the coordinator side.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Started {
        worker_id: usize,
        at: DateTime<Utc>,
    },
    Retired {
        worker_id: usize,
        chunks_processed: usize,
    },
    Log {
        worker_id: usize,
        message: String,
    },
    ItemFailed {
        worker_id: usize,
        item: WorkItemId,
        reason: String,
    },
    ChunkFailed {
        worker_id: usize,
        chunk_id: u32,
        reason: String,
    },
}

/// Final accounting for one engine run, serializable for external reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    pub state: EngineState,
    pub chunks_dispatched: usize,
    pub chunks_failed: usize,
    pub items_completed: usize,
    pub items_failed: usize,
}

impl EngineReport {
    /// A report for a run that never produced accounting.
    pub fn aborted() -> Self {
        Self {
            state: EngineState::Aborted,
            chunks_dispatched: 0,
            chunks_failed: 0,
            items_completed: 0,
            items_failed: 0,
        }
    }
}

/// Lock-free counters shared between workers and the supervisor.
#[derive(Debug, Default)]
struct SharedEngineStats {
    chunks_dispatched: AtomicUsize,
    chunks_failed: AtomicUsize,
    items_completed: AtomicUsize,
    items_failed: AtomicUsize,
}

impl SharedEngineStats {
    fn report(&self, state: EngineState) -> EngineReport {
        EngineReport {
            state,
            chunks_dispatched: self.chunks_dispatched.load(Ordering::SeqCst),
            chunks_failed: self.chunks_failed.load(Ordering::SeqCst),
            items_completed: self.items_completed.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
        }
    }
}

/// Everything a worker needs, cheap to clone per spawn.
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<Mutex<VecDeque<Chunk>>>,
    record_tx: mpsc::UnboundedSender<Vec<Record>>,
    diag_tx: mpsc::UnboundedSender<WorkerMessage>,
    cancelled: Arc<AtomicBool>,
    stats: Arc<SharedEngineStats>,
    max_tasks: usize,
}

enum WorkerExit {
    Finished,
    Recycled,
}

/// Drives a queue of chunks through a worker pool to completion.
pub struct ExecutionEngine {
    config: ExperimentConfig,
}

impl ExecutionEngine {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    /// Runs the pool until the queue drains or cancellation wins.
    ///
    /// Records stream out through `record_tx` as items complete. An item's
    /// records travel as ONE channel message, sent only after the item
    /// finishes: the coordinator either receives the whole batch or none of
    /// it, even when a worker is abandoned mid-chunk, so a durable
    /// interaction record always implies the whole item completed.
    /// `shutdown` requests a cooperative stop: in-flight items may finish,
    /// nothing new is started, and workers still running after the grace
    /// period are abandoned.
    pub async fn run(
        &self,
        chunks: Vec<Chunk>,
        record_tx: mpsc::UnboundedSender<Vec<Record>>,
        shutdown: broadcast::Sender<()>,
    ) -> EngineReport {
        let run_id = Uuid::new_v4();
        let total_chunks = chunks.len();
        info!(
            %run_id,
            chunks = total_chunks,
            workers = self.config.processes,
            "Engine dispatching"
        );

        let queue = Arc::new(Mutex::new(VecDeque::from(chunks)));
        let stats = Arc::new(SharedEngineStats::default());
        let cancelled = Arc::new(AtomicBool::new(false));

        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_diagnostics(diag_rx));

        let cancel_flag = Arc::clone(&cancelled);
        let mut shutdown_rx = shutdown.subscribe();
        let listener = tokio::spawn(async move {
            if shutdown_rx.recv().await.is_ok() {
                info!("Cancellation requested; no new work will start");
                cancel_flag.store(true, Ordering::SeqCst);
            }
        });

        let ctx = WorkerContext {
            queue,
            record_tx,
            diag_tx: diag_tx.clone(),
            cancelled: Arc::clone(&cancelled),
            stats: Arc::clone(&stats),
            max_tasks: self.config.max_tasks_per_worker,
        };

        let mut workers: JoinSet<WorkerExit> = JoinSet::new();
        let mut next_worker_id = 0usize;
        for _ in 0..self.config.processes.max(1) {
            workers.spawn(worker_loop(next_worker_id, ctx.clone()));
            next_worker_id += 1;
        }

        let mut draining = false;
        let mut abandoned = false;
        loop {
            if cancelled.load(Ordering::SeqCst) && !draining {
                draining = true;
                debug!(state = ?EngineState::Draining, "Waiting for in-flight work");
            }

            let joined = if draining {
                match tokio::time::timeout(self.config.grace_period, workers.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            grace_ms = self.config.grace_period.as_millis() as u64,
                            "Grace period elapsed; abandoning in-flight workers"
                        );
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                        abandoned = true;
                        break;
                    }
                }
            } else {
                workers.join_next().await
            };

            match joined {
                None => break,
                Some(Ok(WorkerExit::Finished)) => {}
                Some(Ok(WorkerExit::Recycled)) => {
                    let has_work = !cancelled.load(Ordering::SeqCst)
                        && !self.queue_is_empty(&ctx);
                    if has_work {
                        debug!(worker_id = next_worker_id, "Spawning replacement worker");
                        workers.spawn(worker_loop(next_worker_id, ctx.clone()));
                        next_worker_id += 1;
                    }
                }
                Some(Err(join_err)) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    error!(error = %join_err, "Worker terminated abnormally");
                    let has_work = !cancelled.load(Ordering::SeqCst)
                        && !self.queue_is_empty(&ctx);
                    if has_work {
                        debug!(worker_id = next_worker_id, "Spawning replacement worker");
                        workers.spawn(worker_loop(next_worker_id, ctx.clone()));
                        next_worker_id += 1;
                    }
                }
            }
        }

        listener.abort();
        let _ = listener.await;

        // Workers are gone (or abandoned); close our diagnostic handles so
        // the relay can drain. Abandoned blocking bodies may still hold
        // senders, so on a forced stop the relay is cut rather than awaited.
        drop(ctx);
        drop(diag_tx);
        if abandoned {
            relay.abort();
        }
        let _ = relay.await;

        let state = if cancelled.load(Ordering::SeqCst) {
            EngineState::Aborted
        } else {
            EngineState::Done
        };
        let report = stats.report(state);
        info!(
            %run_id,
            state = ?report.state,
            chunks_dispatched = report.chunks_dispatched,
            chunks_failed = report.chunks_failed,
            items_completed = report.items_completed,
            items_failed = report.items_failed,
            "Engine finished"
        );
        report
    }

    fn queue_is_empty(&self, ctx: &WorkerContext) -> bool {
        ctx.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }
}

/// One worker: pull, gate, execute, repeat until drained or retired.
async fn worker_loop(worker_id: usize, ctx: WorkerContext) -> WorkerExit {
    let _ = ctx.diag_tx.send(WorkerMessage::Started {
        worker_id,
        at: Utc::now(),
    });

    let mut processed = 0usize;
    loop {
        if ctx.cancelled.load(Ordering::SeqCst) {
            return WorkerExit::Finished;
        }
        let chunk = match ctx.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        let Some(chunk) = chunk else {
            return WorkerExit::Finished;
        };

        let chunk_id = chunk.id;
        ctx.stats.chunks_dispatched.fetch_add(1, Ordering::SeqCst);

        // Dispatch gate: every collaborator description must serialize before
        // the chunk crosses the worker boundary.
        if let Err(err) = chunk.manifest() {
            let n_items = chunk.len();
            ctx.stats.chunks_failed.fetch_add(1, Ordering::SeqCst);
            ctx.stats.items_failed.fetch_add(n_items, Ordering::SeqCst);
            let _ = ctx.diag_tx.send(WorkerMessage::ChunkFailed {
                worker_id,
                chunk_id,
                reason: format!(
                    "chunk could not be serialized for dispatch: {err}; \
                     ensure every environment, learner and evaluator exposes \
                     JSON-serializable params"
                ),
            });
            continue;
        }

        let body_ctx = ctx.clone();
        let outcome =
            tokio::task::spawn_blocking(move || process_chunk(worker_id, chunk, &body_ctx)).await;
        if let Err(join_err) = outcome {
            // The chunk body died outside per-item isolation; only this
            // chunk's remaining items are lost.
            ctx.stats.chunks_failed.fetch_add(1, Ordering::SeqCst);
            let _ = ctx.diag_tx.send(WorkerMessage::ChunkFailed {
                worker_id,
                chunk_id,
                reason: format!("worker crashed mid-chunk: {join_err}"),
            });
        }

        processed += 1;
        if ctx.max_tasks != 0 && processed >= ctx.max_tasks {
            let _ = ctx.diag_tx.send(WorkerMessage::Retired {
                worker_id,
                chunks_processed: processed,
            });
            return WorkerExit::Recycled;
        }
    }
}

/// Evaluates each item in the chunk, isolating per-item failures.
fn process_chunk(worker_id: usize, chunk: Chunk, ctx: &WorkerContext) {
    for item in chunk.items {
        if ctx.cancelled.load(Ordering::SeqCst) {
            let _ = ctx.diag_tx.send(WorkerMessage::Log {
                worker_id,
                message: format!(
                    "cancelled; leaving remaining items of chunk {} for resumption",
                    chunk.id
                ),
            });
            return;
        }

        let item_id = item.id();
        match catch_unwind(AssertUnwindSafe(|| evaluate_item(&item))) {
            Ok(records) => {
                // One message per completed item: the coordinator never
                // observes a partially recorded item, even if this thread is
                // abandoned right after the send.
                if ctx.record_tx.send(records).is_err() {
                    return;
                }
                ctx.stats.items_completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(payload) => {
                ctx.stats.items_failed.fetch_add(1, Ordering::SeqCst);
                let _ = ctx.diag_tx.send(WorkerMessage::ItemFailed {
                    worker_id,
                    item: item_id,
                    reason: panic_message(payload),
                });
            }
        }
    }
}

/// Runs one work item to completion, buffering its records.
fn evaluate_item(item: &WorkItem) -> Vec<Record> {
    let mut records = vec![
        Record::EnvironmentParams {
            env_id: item.env_id,
            params: item.environment.params(),
        },
        Record::LearnerParams {
            lrn_id: item.lrn_id,
            params: item.learner.params(),
        },
        Record::EvaluatorParams {
            val_id: item.val_id,
            params: item.evaluator.params(),
        },
    ];
    let observations = item
        .evaluator
        .evaluate(item.environment.as_ref(), item.learner.as_ref());
    for (index, observation) in observations.enumerate() {
        records.push(Record::Interaction {
            env_id: item.env_id,
            lrn_id: item.lrn_id,
            val_id: item.val_id,
            index: index as u64,
            observation,
        });
    }
    records
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluation panicked with a non-string payload".to_string()
    }
}

/// Turns worker diagnostics into structured log events.
async fn relay_diagnostics(mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Started { worker_id, at } => {
                debug!(worker_id, started_at = %at, "Worker started");
            }
            WorkerMessage::Retired {
                worker_id,
                chunks_processed,
            } => {
                debug!(worker_id, chunks_processed, "Worker retired at task limit");
            }
            WorkerMessage::Log { worker_id, message } => {
                info!(worker_id, "{message}");
            }
            WorkerMessage::ItemFailed {
                worker_id,
                item,
                reason,
            } => {
                warn!(worker_id, ?item, %reason, "Work item failed; continuing");
            }
            WorkerMessage::ChunkFailed {
                worker_id,
                chunk_id,
                reason,
            } => {
                warn!(worker_id, chunk_id, %reason, "Chunk failed; continuing");
            }
        }
    }
}
