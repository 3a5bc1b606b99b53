//! Collaborator traits consumed by the experiment core.
//!
//! Environments, learners and evaluators are external collaborators: the
//! core only ever sees their `params()` (used for identity and grouping) and
//! their lazy `read()`/`evaluate()` entry points. Concrete dataset loaders
//! and learner implementations live outside this crate.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::pipes::Stream;

/// A structural description of a collaborator.
///
/// Ordered so that serializing two identical descriptions always yields the
/// same text, which is what stable id assignment relies on.
pub type Params = BTreeMap<String, Value>;

/// One interaction observation produced by an evaluator.
///
/// The core treats observations as opaque payloads; only the result
/// aggregator ever looks inside, and then only through caller-supplied keys.
pub type Observation = Value;

/// Builds a [`Params`] map from `(key, value)` pairs.
pub fn params_from<I, K>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// A source of interactions to learn and evaluate on.
pub trait Environment: Send + Sync {
    /// Structural description used for identity, grouping and the log.
    fn params(&self) -> Params;

    /// Lazily reads the environment's interaction sequence.
    fn read(&self) -> Stream<Observation>;

    /// Identity of the pre-filter source this environment was derived from.
    ///
    /// Environments sharing a `source_group` share expensive upstream work,
    /// so by-source chunking places them in the same worker where a
    /// [`Cache`](crate::pipes::Cache) lets that work happen once. The
    /// default groups by the full structural description, i.e. no sharing
    /// beyond identical environments.
    fn source_group(&self) -> String {
        serde_json::to_string(&self.params()).unwrap_or_default()
    }
}

/// A learner whose performance is being measured.
pub trait Learner: Send + Sync {
    fn params(&self) -> Params;
}

/// Drives a learner through an environment and yields observation records.
pub trait Evaluator: Send + Sync {
    fn params(&self) -> Params;

    /// Lazily evaluates `learner` on `environment`'s interactions.
    ///
    /// The returned stream's order is significant: the position of each
    /// observation becomes the interaction index in the transaction log.
    fn evaluate(&self, environment: &dyn Environment, learner: &dyn Learner)
        -> Stream<Observation>;
}
