//! crossbench: Resumable offline benchmarking of sequential learners.
//!
//! This library runs the cross product of environments, learners and
//! evaluators, records every interaction to an append-only transaction log,
//! and turns a prior (even partially written) log into a resumption point so
//! interrupted experiments complete without repeating finished work.

// Core modules
pub mod config;
pub mod engine;
pub mod error;
pub mod experiments;
pub mod pipes;
pub mod primitives;
pub mod results;
pub mod transactions;

// Re-export the types most callers touch
pub use config::{ConfigError, ExperimentConfig};
pub use engine::{EngineReport, EngineState};
pub use error::ExperimentError;
pub use experiments::{ChunkBy, Experiment};
pub use primitives::{params_from, Environment, Evaluator, Learner, Observation, Params};
pub use results::{moving_average, OnlineStats, ResultSet};
pub use transactions::{ExperimentDescriptor, Record, RestoredLog};
