//! Grouping work items into chunks for parallel dispatch.
//!
//! A chunk is the unit handed to one worker, and also the unit whose
//! manifest must serialize cleanly before dispatch. The policy trades
//! load-balance against redundant recomputation of shared upstream
//! environment state:
//!
//! - [`ChunkBy::Task`]: one item per chunk, for maximum parallelism and
//!   fairness, but any shared upstream work is recomputed per worker.
//! - [`ChunkBy::Source`]: all items sharing an environment's source group go
//!   to one worker, where a [`Cache`](crate::pipes::Cache) lets the
//!   expensive upstream evaluate once.
//!
//! The choice is always an explicit configuration value; it affects
//! performance only, never the produced record set.

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::json;

use super::workitems::WorkItem;

/// The chunking policy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkBy {
    /// One work item per chunk.
    #[default]
    Task,
    /// One chunk per originating environment source group.
    Source,
}

impl FromStr for ChunkBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" | "by_task" => Ok(ChunkBy::Task),
            "source" | "by_source" => Ok(ChunkBy::Source),
            other => Err(format!(
                "unrecognized chunking policy '{other}': expected 'by_task' or 'by_source'"
            )),
        }
    }
}

/// An ordered set of work items assigned to one dispatch unit.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u32,
    pub items: Vec<WorkItem>,
}

impl Chunk {
    /// Serializes the chunk's collaborator descriptions for dispatch.
    ///
    /// Every object a worker needs must be independently reconstructible on
    /// the far side of the dispatch boundary; a manifest that cannot
    /// serialize means this chunk cannot be handed to a worker at all, which
    /// the engine reports as a non-retryable chunk failure.
    pub fn manifest(&self) -> Result<String, serde_json::Error> {
        let items: Vec<serde_json::Value> = self
            .items
            .iter()
            .map(|item| {
                json!({
                    "env_id": item.env_id,
                    "lrn_id": item.lrn_id,
                    "val_id": item.val_id,
                    "env": item.environment.params(),
                    "lrn": item.learner.params(),
                    "val": item.evaluator.params(),
                    "source_group": item.source_group,
                })
            })
            .collect();
        serde_json::to_string(&json!({ "chunk": self.id, "items": items }))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Groups `items` into chunks under `policy`.
///
/// By-source grouping preserves first-seen group order and intra-group item
/// order; no ordering among mixed-size chunks is assumed to be load-optimal.
pub fn chunk(items: Vec<WorkItem>, policy: ChunkBy) -> Vec<Chunk> {
    match policy {
        ChunkBy::Task => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| Chunk {
                id: i as u32,
                items: vec![item],
            })
            .collect(),
        ChunkBy::Source => {
            let mut order: Vec<Vec<WorkItem>> = Vec::new();
            let mut index: HashMap<String, usize> = HashMap::new();
            for item in items {
                match index.get(&item.source_group) {
                    Some(&slot) => order[slot].push(item),
                    None => {
                        index.insert(item.source_group.clone(), order.len());
                        order.push(vec![item]);
                    }
                }
            }
            order
                .into_iter()
                .enumerate()
                .map(|(i, group)| Chunk {
                    id: i as u32,
                    items: group,
                })
                .collect()
        }
    }
}
