//! Top-level error type for experiment runs.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transactions::LogError;

/// Errors that stop a run before or during execution.
///
/// Per-item and per-chunk evaluation failures are not here: those are
/// isolated by the engine and surfaced through diagnostics and the run
/// report instead of aborting the experiment.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(
        "the restored log describes {found_environments} environments and \
         {found_learners} learners but this experiment has \
         {expected_environments} and {expected_learners}; resume with the \
         original definition or point the run at a fresh log"
    )]
    DefinitionMismatch {
        expected_environments: usize,
        expected_learners: usize,
        found_environments: usize,
        found_learners: usize,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
