//! Defining and running experiments.
//!
//! An [`Experiment`] is the declarative top: lists of environments, learners
//! and evaluators plus an [`ExperimentConfig`]. Evaluation reconciles the
//! definition against any prior transaction log, builds the pending work-item
//! cross product, chunks it, and drives the chunks through the execution
//! engine while the coordinator alone appends durable records to the sink.
//!
//! The same call serves first runs and resumptions: pointing two runs of an
//! identical definition at the same log path completes whatever the first
//! run left unfinished, and a second run over a complete log does no work.

pub mod chunking;
pub mod workitems;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::config::ExperimentConfig;
use crate::engine::{EngineReport, EngineState, ExecutionEngine};
use crate::error::ExperimentError;
use crate::primitives::{Environment, Evaluator, Learner};
use crate::results::ResultSet;
use crate::transactions::{ExperimentDescriptor, LogError, Record, RestoredLog, TransactionSink};

pub use chunking::{chunk, Chunk, ChunkBy};
pub use workitems::{build_work_items, remove_finished, WorkItem};

/// A declarative experiment: what to evaluate, and how to run it.
pub struct Experiment {
    environments: Vec<Arc<dyn Environment>>,
    learners: Vec<Arc<dyn Learner>>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    config: ExperimentConfig,
}

impl Experiment {
    pub fn new(
        environments: Vec<Arc<dyn Environment>>,
        learners: Vec<Arc<dyn Learner>>,
        evaluators: Vec<Arc<dyn Evaluator>>,
    ) -> Self {
        Self {
            environments,
            learners,
            evaluators,
            config: ExperimentConfig::default(),
        }
    }

    /// Replaces the execution configuration.
    pub fn with_config(mut self, config: ExperimentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// The descriptor this definition would record in a log.
    pub fn descriptor(&self) -> ExperimentDescriptor {
        ExperimentDescriptor {
            n_learners: self.learners.len(),
            n_environments: self.environments.len(),
        }
    }

    /// Runs (or resumes) the experiment, recording to `path` if given.
    ///
    /// With `path = None` records are collected in memory and the run is not
    /// resumable. See [`Experiment::evaluate_with_shutdown`] for the full
    /// contract.
    pub async fn evaluate(&self, path: Option<&Path>) -> Result<ResultSet, ExperimentError> {
        let (shutdown, _) = broadcast::channel(1);
        self.evaluate_with_shutdown(path, shutdown).await
    }

    /// Runs (or resumes) the experiment with cooperative cancellation.
    ///
    /// Sending on `shutdown` requests an early stop: in-flight work may
    /// finish within the configured grace period, nothing new starts, and
    /// everything recorded so far stays durable, so the same call against
    /// the same path later picks up where this one stopped.
    ///
    /// Fails up front if the restored log's descriptor disagrees with this
    /// definition; a log from a different experiment cannot be extended.
    pub async fn evaluate_with_shutdown(
        &self,
        path: Option<&Path>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<ResultSet, ExperimentError> {
        self.config.validate()?;
        let descriptor = self.descriptor();

        let restored = match path {
            Some(p) if p.exists() => RestoredLog::load(p)?,
            _ => RestoredLog::default(),
        };
        if let Some(found) = restored.descriptor {
            if found != descriptor {
                return Err(ExperimentError::DefinitionMismatch {
                    expected_environments: descriptor.n_environments,
                    expected_learners: descriptor.n_learners,
                    found_environments: found.n_environments,
                    found_learners: found.n_learners,
                });
            }
        }

        let items = build_work_items(&self.environments, &self.learners, &self.evaluators);
        let total_items = items.len();
        let pending = remove_finished(items, &restored.finished);
        let chunks = chunk(pending, self.config.chunk_by);
        info!(
            total_items,
            pending_items = chunks.iter().map(|c| c.len()).sum::<usize>(),
            chunks = chunks.len(),
            resumed = !restored.is_empty(),
            "Starting experiment"
        );

        let mut sink = match path {
            Some(p) => TransactionSink::file(p, &restored, descriptor)?,
            None => TransactionSink::memory(descriptor),
        };

        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let engine = ExecutionEngine::new(self.config.clone());
        let engine_shutdown = shutdown.clone();
        let mut engine_task =
            tokio::spawn(async move { engine.run(chunks, record_tx, engine_shutdown).await });

        // The coordinator is the only writer: each received message is the
        // complete record set of one finished work item and is appended as a
        // unit, so the log never holds a partial item even when workers are
        // abandoned mid-chunk.
        let mut append_error: Option<LogError> = None;
        let report = loop {
            tokio::select! {
                result = &mut engine_task => {
                    while let Ok(batch) = record_rx.try_recv() {
                        if append_error.is_none() {
                            if let Err(err) = append_batch(&mut sink, batch) {
                                append_error = Some(err);
                            }
                        }
                    }
                    break finished_report(result);
                }
                maybe = record_rx.recv() => {
                    match maybe {
                        Some(batch) if append_error.is_none() => {
                            if let Err(err) = append_batch(&mut sink, batch) {
                                // Nothing further can be made durable.
                                error!(error = %err, "Append failed; stopping the run");
                                append_error = Some(err);
                                let _ = shutdown.send(());
                            }
                        }
                        Some(_) => {}
                        None => break finished_report((&mut engine_task).await),
                    }
                }
            }
        };

        if let Some(err) = append_error {
            return Err(ExperimentError::Log(err));
        }

        if report.state == EngineState::Aborted {
            info!("Run stopped early; the log remains a valid resumption point");
        }
        info!(
            items_completed = report.items_completed,
            items_failed = report.items_failed,
            chunks_failed = report.chunks_failed,
            "Experiment finished"
        );

        match path {
            Some(p) => {
                drop(sink);
                Ok(ResultSet::from_file(p)?)
            }
            None => Ok(ResultSet::from_records(sink.into_records())),
        }
    }
}

fn append_batch(sink: &mut TransactionSink, batch: Vec<Record>) -> Result<(), LogError> {
    for record in batch {
        sink.append(record)?;
    }
    Ok(())
}

fn finished_report(result: Result<EngineReport, tokio::task::JoinError>) -> EngineReport {
    result.unwrap_or_else(|join_err| {
        error!(error = %join_err, "Engine task failed");
        EngineReport::aborted()
    })
}
