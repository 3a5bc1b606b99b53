//! Grouped, queryable views over a finished (or in-flight) record stream.
//!
//! [`ResultSet`] indexes the flat record stream by environment, learner and
//! evaluator id. It never mutates the underlying log; it is rebuilt from the
//! full record set whenever new records arrive.

pub mod stats;

use std::collections::BTreeMap;
use std::path::Path;

use crate::primitives::{Observation, Params};
use crate::transactions::{
    ExperimentDescriptor, LogError, Record, RestoredLog, WorkItemId,
};

pub use stats::{moving_average, OnlineStats};

/// One recorded interaction, positioned within its work item's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionEntry {
    pub index: u64,
    pub observation: Observation,
}

/// An indexed, derived view over the transaction log's records.
#[derive(Debug, Default, Clone)]
pub struct ResultSet {
    descriptor: Option<ExperimentDescriptor>,
    env_params: BTreeMap<u32, Params>,
    lrn_params: BTreeMap<u32, Params>,
    val_params: BTreeMap<u32, Params>,
    interactions: BTreeMap<WorkItemId, Vec<InteractionEntry>>,
}

impl ResultSet {
    /// Builds the view by indexing a flat record stream.
    ///
    /// Interaction order within a work item follows record order, which the
    /// engine guarantees matches emission order.
    pub fn from_records<I: IntoIterator<Item = Record>>(records: I) -> Self {
        let mut set = ResultSet::default();
        for record in records {
            match record {
                Record::Version { .. } => {}
                Record::Experiment {
                    n_learners,
                    n_environments,
                } => {
                    set.descriptor.get_or_insert(ExperimentDescriptor {
                        n_learners,
                        n_environments,
                    });
                }
                Record::EnvironmentParams { env_id, params } => {
                    set.env_params.insert(env_id, params);
                }
                Record::LearnerParams { lrn_id, params } => {
                    set.lrn_params.insert(lrn_id, params);
                }
                Record::EvaluatorParams { val_id, params } => {
                    set.val_params.insert(val_id, params);
                }
                Record::Interaction {
                    env_id,
                    lrn_id,
                    val_id,
                    index,
                    observation,
                } => {
                    set.interactions
                        .entry((env_id, lrn_id, val_id))
                        .or_default()
                        .push(InteractionEntry { index, observation });
                }
            }
        }
        set
    }

    /// Reads and indexes a transaction log file.
    pub fn from_file(path: &Path) -> Result<Self, LogError> {
        let restored = RestoredLog::load(path)?;
        Ok(Self::from_records(restored.records))
    }

    pub fn descriptor(&self) -> Option<ExperimentDescriptor> {
        self.descriptor
    }

    pub fn environments(&self) -> &BTreeMap<u32, Params> {
        &self.env_params
    }

    pub fn learners(&self) -> &BTreeMap<u32, Params> {
        &self.lrn_params
    }

    pub fn evaluators(&self) -> &BTreeMap<u32, Params> {
        &self.val_params
    }

    /// The ordered interaction list for one work item, if any was recorded.
    pub fn interactions(&self, id: WorkItemId) -> Option<&[InteractionEntry]> {
        self.interactions.get(&id).map(Vec::as_slice)
    }

    /// All work items that have recorded interactions.
    pub fn work_item_ids(&self) -> impl Iterator<Item = WorkItemId> + '_ {
        self.interactions.keys().copied()
    }

    pub fn n_interactions(&self) -> usize {
        self.interactions.values().map(Vec::len).sum()
    }

    /// Keeps only environments whose params satisfy `predicate`.
    ///
    /// Interactions referencing removed environments are dropped from the
    /// view; the underlying log is untouched.
    pub fn filter_environments(&self, predicate: impl Fn(&Params) -> bool) -> ResultSet {
        let env_params: BTreeMap<u32, Params> = self
            .env_params
            .iter()
            .filter(|(_, p)| predicate(p))
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        let interactions = self
            .interactions
            .iter()
            .filter(|((env_id, _, _), _)| env_params.contains_key(env_id))
            .map(|(id, entries)| (*id, entries.clone()))
            .collect();
        ResultSet {
            descriptor: self.descriptor,
            env_params,
            lrn_params: self.lrn_params.clone(),
            val_params: self.val_params.clone(),
            interactions,
        }
    }

    /// Keeps only learners whose params satisfy `predicate`.
    pub fn filter_learners(&self, predicate: impl Fn(&Params) -> bool) -> ResultSet {
        let lrn_params: BTreeMap<u32, Params> = self
            .lrn_params
            .iter()
            .filter(|(_, p)| predicate(p))
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        let interactions = self
            .interactions
            .iter()
            .filter(|((_, lrn_id, _), _)| lrn_params.contains_key(lrn_id))
            .map(|(id, entries)| (*id, entries.clone()))
            .collect();
        ResultSet {
            descriptor: self.descriptor,
            env_params: self.env_params.clone(),
            lrn_params,
            val_params: self.val_params.clone(),
            interactions,
        }
    }

    /// Extracts a numeric series from one work item's observations.
    ///
    /// Observations lacking `key` (or holding a non-numeric value there) are
    /// skipped. Feed the series to [`moving_average`] or [`OnlineStats`].
    pub fn observation_series(&self, id: WorkItemId, key: &str) -> Vec<f64> {
        self.interactions(id)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.observation.get(key).and_then(|v| v.as_f64()))
            .collect()
    }

    /// Streaming mean/variance over one work item's numeric series.
    pub fn stats_for(&self, id: WorkItemId, key: &str) -> OnlineStats {
        OnlineStats::from_values(&self.observation_series(id, key))
    }

    /// Interaction triples whose param records are missing from the view.
    ///
    /// A finalized log must yield an empty list here: every interaction's
    /// (env, lrn, val) triple requires its three param records.
    pub fn missing_params(&self) -> Vec<WorkItemId> {
        self.interactions
            .keys()
            .filter(|(e, l, v)| {
                !self.env_params.contains_key(e)
                    || !self.lrn_params.contains_key(l)
                    || !self.val_params.contains_key(v)
            })
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::params_from;
    use serde_json::json;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::Version { schema: 4 },
            Record::Experiment {
                n_learners: 2,
                n_environments: 1,
            },
            Record::EnvironmentParams {
                env_id: 0,
                params: params_from([("rows", json!(10))]),
            },
            Record::LearnerParams {
                lrn_id: 0,
                params: params_from([("family", json!("random"))]),
            },
            Record::LearnerParams {
                lrn_id: 1,
                params: params_from([("family", json!("greedy"))]),
            },
            Record::EvaluatorParams {
                val_id: 0,
                params: params_from([("eval", json!("on-policy"))]),
            },
            Record::Interaction {
                env_id: 0,
                lrn_id: 0,
                val_id: 0,
                index: 0,
                observation: json!({ "reward": 1.0 }),
            },
            Record::Interaction {
                env_id: 0,
                lrn_id: 0,
                val_id: 0,
                index: 1,
                observation: json!({ "reward": 3.0 }),
            },
            Record::Interaction {
                env_id: 0,
                lrn_id: 1,
                val_id: 0,
                index: 0,
                observation: json!({ "reward": 2.0 }),
            },
        ]
    }

    #[test]
    fn test_indexing_by_triple() {
        let set = ResultSet::from_records(sample_records());
        assert_eq!(set.environments().len(), 1);
        assert_eq!(set.learners().len(), 2);
        assert_eq!(set.n_interactions(), 3);

        let entries = set.interactions((0, 0, 0)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[1].index, 1);
    }

    #[test]
    fn test_filter_learners_drops_interactions() {
        let set = ResultSet::from_records(sample_records());
        let greedy = set.filter_learners(|p| p.get("family") == Some(&json!("greedy")));

        assert_eq!(greedy.learners().len(), 1);
        assert!(greedy.interactions((0, 0, 0)).is_none());
        assert!(greedy.interactions((0, 1, 0)).is_some());
        // The original view is untouched.
        assert_eq!(set.n_interactions(), 3);
    }

    #[test]
    fn test_filter_environments() {
        let set = ResultSet::from_records(sample_records());
        let none = set.filter_environments(|p| p.get("rows") == Some(&json!(99)));
        assert!(none.environments().is_empty());
        assert_eq!(none.n_interactions(), 0);
    }

    #[test]
    fn test_observation_series_and_stats() {
        let set = ResultSet::from_records(sample_records());
        let series = set.observation_series((0, 0, 0), "reward");
        assert_eq!(series, vec![1.0, 3.0]);

        let stats = set.stats_for((0, 0, 0), "reward");
        assert_eq!(stats.count(), 2);
        assert!((stats.mean() - 2.0).abs() < 1e-12);

        assert!(set.observation_series((0, 0, 0), "absent").is_empty());
    }

    #[test]
    fn test_missing_params_detection() {
        let set = ResultSet::from_records(vec![Record::Interaction {
            env_id: 5,
            lrn_id: 0,
            val_id: 0,
            index: 0,
            observation: json!({}),
        }]);
        assert_eq!(set.missing_params(), vec![(5, 0, 0)]);

        let complete = ResultSet::from_records(sample_records());
        assert!(complete.missing_params().is_empty());
    }
}
