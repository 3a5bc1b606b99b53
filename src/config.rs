//! Configuration for experiment execution.
//!
//! A single explicit [`ExperimentConfig`] value is threaded through the
//! engine and sink at construction; there is no process-wide configuration
//! singleton. [`Default`] carries the library-level defaults used whenever
//! the caller leaves a knob unset.

use std::time::Duration;

use thiserror::Error;

use crate::experiments::chunking::ChunkBy;

/// Errors raised while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Execution knobs consumed by the experiment core.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Number of concurrent workers. 1 means sequential execution.
    pub processes: usize,
    /// Chunks a worker completes before being recycled. 0 means unlimited.
    pub max_tasks_per_worker: usize,
    /// How pending work items are grouped for dispatch.
    pub chunk_by: ChunkBy,
    /// Bounded wait for in-flight workers after a cancellation signal.
    pub grace_period: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            max_tasks_per_worker: 0,
            chunk_by: ChunkBy::Task,
            grace_period: Duration::from_secs(5),
        }
    }
}

impl ExperimentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker count.
    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Sets how many chunks a worker completes before being recycled.
    pub fn with_max_tasks_per_worker(mut self, max_tasks: usize) -> Self {
        self.max_tasks_per_worker = max_tasks;
        self
    }

    /// Sets the chunking policy.
    pub fn with_chunk_by(mut self, chunk_by: ChunkBy) -> Self {
        self.chunk_by = chunk_by;
        self
    }

    /// Sets the cancellation grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Checks the configuration before any work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "processes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}
