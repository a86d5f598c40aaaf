use crate::error::{ClusterError, Result};
use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Unique identifier for a task within the cluster.
///
/// Wrapper around a UUID v4 string generated by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    LoadModel,
    UnloadModel,
    Predict,
    Train,
}

/// Lifecycle state of a task.
///
/// `Created -> Running -> {Completed, CompletedWithError, Failed}`. `Created` may
/// jump straight to a terminal state when dispatch never happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    /// Some, but not all, workers reported an error.
    CompletedWithError,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::CompletedWithError | TaskState::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Running => 1,
            TaskState::Completed | TaskState::CompletedWithError | TaskState::Failed => 2,
        }
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// A model load/unload (or other ML) job tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MlTask {
    pub task_id: TaskId,
    pub model_id: String,
    pub task_type: TaskType,
    pub state: TaskState,
    pub coordinating_node: NodeId,
    pub worker_nodes: BTreeSet<NodeId>,
    /// Worker id -> error reported by that worker.
    #[serde(default)]
    pub node_errors: BTreeMap<NodeId, String>,
    pub create_time: u64,
    pub last_update_time: u64,
    pub error: Option<String>,
    pub is_async: bool,
}

impl MlTask {
    pub fn new(model_id: impl Into<String>, task_type: TaskType, coordinating_node: NodeId) -> Self {
        let now = now_ms();
        Self {
            task_id: TaskId::new(),
            model_id: model_id.into(),
            task_type,
            state: TaskState::Created,
            coordinating_node,
            worker_nodes: BTreeSet::new(),
            node_errors: BTreeMap::new(),
            create_time: now,
            last_update_time: now,
            error: None,
            is_async: true,
        }
    }

    pub fn with_workers(mut self, workers: impl IntoIterator<Item = NodeId>) -> Self {
        self.worker_nodes.extend(workers);
        self
    }

    /// Applies a partial update.
    ///
    /// Returns `Ok(false)` when the task is already in the requested terminal
    /// state, which makes duplicate terminal updates harmless.
    pub fn apply(&mut self, update: &TaskUpdate) -> Result<bool> {
        if self.state.is_terminal() {
            if update.state == Some(self.state) {
                return Ok(false);
            }
            return Err(ClusterError::TaskTerminal(self.task_id.to_string()));
        }

        if let Some(next) = update.state
            && next != self.state
        {
            if !self.state.can_transition_to(next) {
                return Err(ClusterError::IllegalTransition {
                    task_id: self.task_id.to_string(),
                    from: self.state,
                    to: next,
                });
            }
            self.state = next;
        }

        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        for (node, error) in &update.node_errors {
            self.node_errors.insert(node.clone(), error.clone());
        }
        self.last_update_time = now_ms();
        Ok(true)
    }
}

/// Partial task update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub error: Option<String>,
    #[serde(default)]
    pub node_errors: BTreeMap<NodeId, String>,
}

impl TaskUpdate {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::state(TaskState::Failed).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Per-state task counts of one registry, reported in profiles and stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatusCounts {
    pub created: usize,
    pub running: usize,
    pub completed: usize,
    pub completed_with_error: usize,
    pub failed: usize,
}

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
