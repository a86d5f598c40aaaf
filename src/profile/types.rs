use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::membership::types::NodeId;
use crate::task::types::{MlTask, TaskId, TaskStatusCounts};

/// Which part of the cluster state to report. Empty sets mean "everything".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileFilter {
    pub task_ids: BTreeSet<TaskId>,
    pub model_ids: BTreeSet<String>,
    pub node_ids: BTreeSet<NodeId>,
}

impl ProfileFilter {
    /// True when neither tasks nor models are narrowed.
    pub fn returns_all(&self) -> bool {
        self.task_ids.is_empty() && self.model_ids.is_empty()
    }

    pub fn wants_task(&self, task: &MlTask) -> bool {
        self.returns_all() || self.task_ids.contains(&task.task_id)
    }

    pub fn wants_model(&self, model_id: &str) -> bool {
        self.returns_all() || self.model_ids.contains(model_id)
    }

    pub fn wants_node(&self, node_id: &NodeId) -> bool {
        self.node_ids.is_empty() || self.node_ids.contains(node_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelProfile {
    /// Resident in this node's runtime.
    pub loaded: bool,
    /// Workers this node's routing table lists for the model.
    pub routed_workers: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeProfile {
    pub node_id: NodeId,
    pub tasks: BTreeMap<TaskId, MlTask>,
    pub models: BTreeMap<String, ModelProfile>,
    pub task_counts: TaskStatusCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub nodes: BTreeMap<NodeId, NodeProfile>,
    pub failures: BTreeMap<NodeId, String>,
}
