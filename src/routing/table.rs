use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

use crate::membership::types::NodeId;

#[derive(Default)]
pub struct RoutingTable {
    routes: DashMap<String, BTreeSet<NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the pair was not present.
    pub fn add(&self, model_id: &str, node: &NodeId) -> bool {
        self.routes
            .entry(model_id.to_string())
            .or_default()
            .insert(node.clone())
    }

    /// Returns true when the pair was present. Models with no workers left are dropped.
    pub fn remove(&self, model_id: &str, node: &NodeId) -> bool {
        let removed = self
            .routes
            .get_mut(model_id)
            .map(|mut workers| workers.remove(node))
            .unwrap_or(false);
        self.routes.remove_if(model_id, |_, workers| workers.is_empty());
        removed
    }

    pub fn workers(&self, model_id: &str) -> BTreeSet<NodeId> {
        self.routes
            .get(model_id)
            .map(|workers| workers.clone())
            .unwrap_or_default()
    }

    pub fn worker_count(&self, model_id: &str) -> usize {
        self.routes.get(model_id).map(|w| w.len()).unwrap_or(0)
    }

    /// Every `(model, node)` pair.
    pub fn pairs(&self) -> BTreeSet<(String, NodeId)> {
        self.routes
            .iter()
            .flat_map(|entry| {
                let model_id = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |node| (model_id.clone(), node.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<NodeId>> {
        self.routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.routes.clear();
    }
}
