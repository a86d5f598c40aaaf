use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::types::{ModelProfile, NodeProfile, ProfileFilter, ProfileResponse};
use crate::membership::provider::MembershipProvider;
use crate::membership::types::{Node, NodeId};
use crate::routing::RoutingTable;
use crate::runtime::ModelRuntime;
use crate::task::registry::TaskRegistry;
use crate::transport::{ClusterMessage, ClusterReply, SharedTransport, fan_out};

/// Cluster-wide, read-only state snapshot.
pub struct ProfileAggregator {
    membership: Arc<dyn MembershipProvider>,
    transport: SharedTransport,
    timeout: Duration,
}

impl ProfileAggregator {
    pub fn new(
        membership: Arc<dyn MembershipProvider>,
        transport: SharedTransport,
        timeout: Duration,
    ) -> Self {
        Self {
            membership,
            transport,
            timeout,
        }
    }

    /// Asks every selected node for its local profile.
    ///
    /// Nodes that fail or time out are listed in `failures`; the others are
    /// returned regardless.
    pub async fn gather_profile(&self, filter: ProfileFilter) -> ProfileResponse {
        let targets: Vec<Node> = self
            .membership
            .current_nodes()
            .into_iter()
            .filter(|node| filter.wants_node(&node.id))
            .collect();

        let result = fan_out(
            self.transport.as_ref(),
            &targets,
            ClusterMessage::Profile(filter),
            self.timeout,
            ClusterReply::into_profile,
        )
        .await;

        tracing::debug!(
            "Profile gathered from {} node(s), {} failure(s)",
            result.successes.len(),
            result.failures.len()
        );
        ProfileResponse {
            nodes: result.successes,
            failures: result.failures,
        }
    }
}

/// Node-side profile built only from local state.
pub fn local_profile(
    node_id: &NodeId,
    tasks: &TaskRegistry,
    runtime: &dyn ModelRuntime,
    routing: &RoutingTable,
    filter: &ProfileFilter,
) -> NodeProfile {
    let selected_tasks = tasks
        .snapshot()
        .into_iter()
        .filter(|task| filter.wants_task(task))
        .map(|task| (task.task_id.clone(), task))
        .collect();

    let mut models: BTreeMap<String, ModelProfile> = BTreeMap::new();
    for model_id in runtime.list_loaded() {
        if filter.wants_model(&model_id) {
            models.entry(model_id).or_default().loaded = true;
        }
    }
    for (model_id, workers) in routing.snapshot() {
        if filter.wants_model(&model_id) {
            models.entry(model_id).or_default().routed_workers = workers;
        }
    }

    NodeProfile {
        node_id: node_id.clone(),
        tasks: selected_tasks,
        models,
        task_counts: tasks.status_counts(),
    }
}
