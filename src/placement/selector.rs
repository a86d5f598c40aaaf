use std::collections::BTreeSet;

use crate::config::PlacementConfig;
use crate::error::{ClusterError, Result};
use crate::membership::types::{Node, NodeId, NodeRole};

pub struct EligibilitySelector {
    config: PlacementConfig,
}

impl EligibilitySelector {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    /// Node ids allowed to host a model, ordered by id.
    ///
    /// ML nodes win; data nodes are used only when there are no ML candidates
    /// and fallback is enabled. Fails with `NoEligibleNodes` on an empty result.
    pub fn select_eligible_nodes(&self, nodes: &[Node]) -> Result<BTreeSet<NodeId>> {
        let candidates: Vec<&Node> = nodes.iter().filter(|node| self.admits(node)).collect();

        let ml_nodes: BTreeSet<NodeId> = candidates
            .iter()
            .filter(|node| node.has_role(NodeRole::Ml))
            .map(|node| node.id.clone())
            .collect();

        let selected = if !ml_nodes.is_empty() {
            ml_nodes
        } else if self.config.allow_data_node_fallback {
            candidates
                .iter()
                .filter(|node| node.has_role(NodeRole::Data))
                .map(|node| node.id.clone())
                .collect()
        } else {
            BTreeSet::new()
        };

        if selected.is_empty() {
            tracing::warn!("No eligible node among {} member(s)", nodes.len());
            return Err(ClusterError::NoEligibleNodes);
        }
        tracing::debug!("Eligible nodes: {:?}", selected);
        Ok(selected)
    }

    fn admits(&self, node: &Node) -> bool {
        if !node.is_alive() || node.is_cluster_manager_only() {
            return false;
        }
        if self.config.exclude_node_names.iter().any(|name| name == &node.name) {
            return false;
        }
        match &self.config.placement_group {
            Some(group) => node.group.as_ref() == Some(group),
            None => true,
        }
    }
}

/// Narrows `eligible` to the nodes a request explicitly names.
///
/// A model already routed to a node outside `requested` cannot be retargeted.
pub fn filter_target_nodes(
    eligible: &BTreeSet<NodeId>,
    requested: Option<&[NodeId]>,
    routed: &BTreeSet<NodeId>,
) -> Result<BTreeSet<NodeId>> {
    let Some(requested) = requested else {
        return Ok(eligible.clone());
    };

    let requested: BTreeSet<NodeId> = requested.iter().cloned().collect();
    let outside: Vec<String> = routed
        .difference(&requested)
        .map(|node| node.to_string())
        .collect();
    if !outside.is_empty() {
        return Err(ClusterError::InvalidRequest(format!(
            "model already loaded on nodes [{}] which are not included in target node ids",
            outside.join(", ")
        )));
    }

    let targets: BTreeSet<NodeId> = requested.intersection(eligible).cloned().collect();
    if targets.is_empty() {
        return Err(ClusterError::NoEligibleNodes);
    }
    Ok(targets)
}
