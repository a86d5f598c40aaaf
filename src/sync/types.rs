use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::membership::types::NodeId;
use crate::task::types::TaskId;

/// What one node reports about itself during a sync pass. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub node_id: NodeId,
    pub model_status: String,
    pub loaded_model_ids: BTreeSet<String>,
    pub loading_model_ids: BTreeSet<String>,
    pub running_load_task_ids: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Repair drift in place.
    #[default]
    Refresh,
    /// Drop the routing table and rebuild it from reports.
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoutePair {
    pub model_id: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub removed: Vec<RoutePair>,
    pub added: Vec<RoutePair>,
    pub orphaned_tasks: Vec<TaskId>,
    pub anomalies: Vec<String>,
    pub unreachable: BTreeMap<NodeId, String>,
    pub models_updated: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.removed.is_empty()
            && self.added.is_empty()
            && self.orphaned_tasks.is_empty()
            && self.anomalies.is_empty()
            && self.unreachable.is_empty()
            && self.models_updated.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub mode: SyncMode,
}
