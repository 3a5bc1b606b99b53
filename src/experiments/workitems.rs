//! Building the pending work-item set for a run.
//!
//! The builder computes the full cross product of environments, learners and
//! evaluators, assigning each distinct collaborator description a stable
//! integer id. Ids follow structural equality of `params()` (not instance
//! identity), so two runs with identical configuration produce identical
//! ids. That stability is what makes resumption detection possible.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::primitives::{Environment, Evaluator, Learner, Params};
use crate::transactions::WorkItemId;

/// One (environment, learner, evaluator) combination to be evaluated.
///
/// Holds shared references, not copies; immutable once created.
#[derive(Clone)]
pub struct WorkItem {
    pub env_id: u32,
    pub lrn_id: u32,
    pub val_id: u32,
    pub environment: Arc<dyn Environment>,
    pub learner: Arc<dyn Learner>,
    pub evaluator: Arc<dyn Evaluator>,
    /// Pre-filter source identity, used by by-source chunking.
    pub source_group: String,
}

impl WorkItem {
    pub fn id(&self) -> WorkItemId {
        (self.env_id, self.lrn_id, self.val_id)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("env_id", &self.env_id)
            .field("lrn_id", &self.lrn_id)
            .field("val_id", &self.val_id)
            .field("source_group", &self.source_group)
            .finish()
    }
}

/// Assigns sequential ids by structural equality of params.
///
/// The first occurrence of a description claims the next id; later
/// occurrences of an identical description reuse it.
fn assign_structural_ids(descriptions: impl Iterator<Item = Params>) -> Vec<u32> {
    let mut by_key: HashMap<String, u32> = HashMap::new();
    descriptions
        .map(|params| {
            let key = serde_json::to_string(&params).unwrap_or_default();
            let next = by_key.len() as u32;
            *by_key.entry(key).or_insert(next)
        })
        .collect()
}

/// Computes the cross product of pending work items.
///
/// Duplicate id triples (possible when a list contains two structurally
/// identical collaborators) collapse into one work item.
pub fn build_work_items(
    environments: &[Arc<dyn Environment>],
    learners: &[Arc<dyn Learner>],
    evaluators: &[Arc<dyn Evaluator>],
) -> Vec<WorkItem> {
    let env_ids = assign_structural_ids(environments.iter().map(|e| e.params()));
    let lrn_ids = assign_structural_ids(learners.iter().map(|l| l.params()));
    let val_ids = assign_structural_ids(evaluators.iter().map(|v| v.params()));

    let mut seen: HashSet<WorkItemId> = HashSet::new();
    let mut items = Vec::with_capacity(environments.len() * learners.len() * evaluators.len());

    for (env, env_id) in environments.iter().zip(&env_ids) {
        for (lrn, lrn_id) in learners.iter().zip(&lrn_ids) {
            for (val, val_id) in evaluators.iter().zip(&val_ids) {
                let id = (*env_id, *lrn_id, *val_id);
                if !seen.insert(id) {
                    debug!(?id, "Skipping structurally duplicate work item");
                    continue;
                }
                items.push(WorkItem {
                    env_id: *env_id,
                    lrn_id: *lrn_id,
                    val_id: *val_id,
                    environment: Arc::clone(env),
                    learner: Arc::clone(lrn),
                    evaluator: Arc::clone(val),
                    source_group: env.source_group(),
                });
            }
        }
    }

    items
}

/// Drops items already completed according to a restored log.
pub fn remove_finished(items: Vec<WorkItem>, finished: &BTreeSet<WorkItemId>) -> Vec<WorkItem> {
    let before = items.len();
    let remaining: Vec<WorkItem> = items
        .into_iter()
        .filter(|item| !finished.contains(&item.id()))
        .collect();
    if remaining.len() != before {
        debug!(
            finished = before - remaining.len(),
            remaining = remaining.len(),
            "Filtered finished work items from restored log"
        );
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::Stream;
    use crate::primitives::{params_from, Observation};
    use serde_json::json;

    struct NamedEnv(&'static str);

    impl Environment for NamedEnv {
        fn params(&self) -> Params {
            params_from([("name", json!(self.0))])
        }

        fn read(&self) -> Stream<Observation> {
            Box::new(std::iter::empty())
        }
    }

    struct NamedLearner(&'static str);

    impl Learner for NamedLearner {
        fn params(&self) -> Params {
            params_from([("name", json!(self.0))])
        }
    }

    struct NamedEvaluator(&'static str);

    impl Evaluator for NamedEvaluator {
        fn params(&self) -> Params {
            params_from([("name", json!(self.0))])
        }

        fn evaluate(&self, _: &dyn Environment, _: &dyn Learner) -> Stream<Observation> {
            Box::new(std::iter::empty())
        }
    }

    fn fixtures(
        envs: &[&'static str],
        lrns: &[&'static str],
    ) -> (Vec<Arc<dyn Environment>>, Vec<Arc<dyn Learner>>, Vec<Arc<dyn Evaluator>>) {
        (
            envs.iter()
                .map(|n| Arc::new(NamedEnv(n)) as Arc<dyn Environment>)
                .collect(),
            lrns.iter()
                .map(|n| Arc::new(NamedLearner(n)) as Arc<dyn Learner>)
                .collect(),
            vec![Arc::new(NamedEvaluator("on-policy")) as Arc<dyn Evaluator>],
        )
    }

    #[test]
    fn test_two_by_two_by_one_yields_four_unique_items() {
        let (envs, lrns, vals) = fixtures(&["a", "b"], &["x", "y"]);
        let items = build_work_items(&envs, &lrns, &vals);

        assert_eq!(items.len(), 4);
        let ids: HashSet<WorkItemId> = items.iter().map(WorkItem::id).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(
            ids,
            HashSet::from([(0, 0, 0), (0, 1, 0), (1, 0, 0), (1, 1, 0)])
        );
    }

    #[test]
    fn test_structural_ids_are_stable_across_builds() {
        let (envs, lrns, vals) = fixtures(&["a", "b"], &["x", "y"]);
        let first: Vec<WorkItemId> = build_work_items(&envs, &lrns, &vals)
            .iter()
            .map(WorkItem::id)
            .collect();
        let second: Vec<WorkItemId> = build_work_items(&envs, &lrns, &vals)
            .iter()
            .map(WorkItem::id)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identical_descriptions_share_an_id() {
        let (envs, lrns, vals) = fixtures(&["a", "b"], &["x", "x"]);
        let items = build_work_items(&envs, &lrns, &vals);

        // Duplicate learner configs collapse: 2 envs x 1 distinct learner.
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.lrn_id == 0));
    }

    #[test]
    fn test_remove_finished_keeps_only_unfinished() {
        let (envs, lrns, vals) = fixtures(&["a", "b"], &["x", "y"]);
        let items = build_work_items(&envs, &lrns, &vals);

        let finished = BTreeSet::from([(0, 0, 0), (0, 1, 0), (1, 0, 0)]);
        let remaining = remove_finished(items, &finished);

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), (1, 1, 0));
    }

    #[test]
    fn test_remove_finished_with_empty_set_is_noop() {
        let (envs, lrns, vals) = fixtures(&["a"], &["x"]);
        let items = build_work_items(&envs, &lrns, &vals);
        let remaining = remove_finished(items, &BTreeSet::new());
        assert_eq!(remaining.len(), 1);
    }
}
