//! The append-only transaction log record model.
//!
//! A [`Record`] is the only unit ever written to the log. Each record is
//! encoded as one minified, self-contained JSON line beginning with a
//! one-letter tag, so the file is both human-recoverable and
//! streaming-append-friendly: a crash mid-run leaves at worst a single
//! truncated trailing line, which the loader discards.
//!
//! Line format by tag:
//!
//! ```text
//! ["V",{"schema":4}]
//! ["X",{"n_learners":2,"n_environments":3}]
//! ["E",0,{"source":"mnist"}]
//! ["L",1,{"family":"epsilon-greedy","epsilon":0.1}]
//! ["N",0,{"eval":"on-policy"}]
//! ["I",[0,1,0],7,{"reward":0.5}]
//! ```

pub mod log;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::primitives::{Observation, Params};

pub use log::{LogError, RestoredLog, TransactionSink};

/// Current schema version of the log format.
pub const SCHEMA_VERSION: u64 = 4;

/// Identity of one work item: (environment, learner, evaluator) ids.
pub type WorkItemId = (u32, u32, u32);

/// The experiment shape recorded in (and recovered from) a log.
///
/// A restored log whose descriptor disagrees with the current run cannot be
/// safely extended and is rejected before any work begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    pub n_learners: usize,
    pub n_environments: usize,
}

/// One typed, appended unit of the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Version {
        schema: u64,
    },
    Experiment {
        n_learners: usize,
        n_environments: usize,
    },
    EnvironmentParams {
        env_id: u32,
        params: Params,
    },
    LearnerParams {
        lrn_id: u32,
        params: Params,
    },
    EvaluatorParams {
        val_id: u32,
        params: Params,
    },
    Interaction {
        env_id: u32,
        lrn_id: u32,
        val_id: u32,
        index: u64,
        observation: Observation,
    },
}

/// A single line failed to decode as a record.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RecordParseError(String);

impl Record {
    /// Encodes the record as one minified JSON line (without a newline).
    pub fn encode(&self) -> String {
        let value = match self {
            Record::Version { schema } => json!(["V", { "schema": schema }]),
            Record::Experiment {
                n_learners,
                n_environments,
            } => json!(["X", { "n_learners": n_learners, "n_environments": n_environments }]),
            Record::EnvironmentParams { env_id, params } => json!(["E", env_id, params]),
            Record::LearnerParams { lrn_id, params } => json!(["L", lrn_id, params]),
            Record::EvaluatorParams { val_id, params } => json!(["N", val_id, params]),
            Record::Interaction {
                env_id,
                lrn_id,
                val_id,
                index,
                observation,
            } => json!(["I", [env_id, lrn_id, val_id], index, observation]),
        };
        value.to_string()
    }

    /// Decodes one log line.
    pub fn decode(line: &str) -> Result<Record, RecordParseError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| RecordParseError(format!("not valid JSON: {e}")))?;
        let parts = value
            .as_array()
            .ok_or_else(|| RecordParseError("record line is not an array".to_string()))?;
        let tag = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RecordParseError("record has no tag".to_string()))?;

        match tag {
            "V" => {
                let schema = field_u64(parts.get(1), "schema")?;
                Ok(Record::Version { schema })
            }
            "X" => {
                let n_learners = field_u64(parts.get(1), "n_learners")? as usize;
                let n_environments = field_u64(parts.get(1), "n_environments")? as usize;
                Ok(Record::Experiment {
                    n_learners,
                    n_environments,
                })
            }
            "E" => {
                let (id, params) = id_and_params(parts)?;
                Ok(Record::EnvironmentParams { env_id: id, params })
            }
            "L" => {
                let (id, params) = id_and_params(parts)?;
                Ok(Record::LearnerParams { lrn_id: id, params })
            }
            "N" => {
                let (id, params) = id_and_params(parts)?;
                Ok(Record::EvaluatorParams { val_id: id, params })
            }
            "I" => {
                let ids = parts
                    .get(1)
                    .and_then(Value::as_array)
                    .ok_or_else(|| RecordParseError("'I' record missing id triple".to_string()))?;
                if ids.len() != 3 {
                    return Err(RecordParseError(format!(
                        "'I' record has {} ids, expected 3",
                        ids.len()
                    )));
                }
                let triple: Vec<u32> = ids
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .map(|n| n as u32)
                            .ok_or_else(|| RecordParseError("non-integer id in triple".to_string()))
                    })
                    .collect::<Result<_, _>>()?;
                let index = parts
                    .get(2)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RecordParseError("'I' record missing index".to_string()))?;
                let observation = parts
                    .get(3)
                    .cloned()
                    .ok_or_else(|| RecordParseError("'I' record missing observation".to_string()))?;
                Ok(Record::Interaction {
                    env_id: triple[0],
                    lrn_id: triple[1],
                    val_id: triple[2],
                    index,
                    observation,
                })
            }
            other => Err(RecordParseError(format!("unknown record tag '{other}'"))),
        }
    }

    /// The id triple for interaction records, `None` otherwise.
    pub fn work_item_id(&self) -> Option<WorkItemId> {
        match self {
            Record::Interaction {
                env_id,
                lrn_id,
                val_id,
                ..
            } => Some((*env_id, *lrn_id, *val_id)),
            _ => None,
        }
    }
}

fn field_u64(value: Option<&Value>, key: &str) -> Result<u64, RecordParseError> {
    value
        .and_then(Value::as_object)
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_u64)
        .ok_or_else(|| RecordParseError(format!("missing integer field '{key}'")))
}

fn id_and_params(parts: &[Value]) -> Result<(u32, Params), RecordParseError> {
    let id = parts
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| RecordParseError("param record missing id".to_string()))? as u32;
    let obj: &Map<String, Value> = parts
        .get(2)
        .and_then(Value::as_object)
        .ok_or_else(|| RecordParseError("param record missing params object".to_string()))?;
    let params = obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    Ok((id, params))
}
