//! Dispatch messages exchanged between coordinator and workers.

use serde::{Deserialize, Serialize};

use crate::membership::types::NodeId;
use crate::task::types::{MlTask, TaskId};

/// Coordinator -> worker: fetch and load a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelInput {
    pub model_id: String,
    pub task_id: TaskId,
    pub worker_node_count: usize,
    pub coordinating_node: NodeId,
    pub task: MlTask,
    pub total_chunks: u32,
    pub content_hash: Option<String>,
}

/// Coordinator -> worker: drop a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelInput {
    pub model_id: String,
    pub task_id: TaskId,
    pub coordinating_node: NodeId,
    pub task: MlTask,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardKind {
    LoadModelDone,
    UnloadModelDone,
}

/// Worker -> coordinator: one worker finished its part of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardInput {
    pub kind: ForwardKind,
    pub task_id: TaskId,
    pub model_id: String,
    pub worker_node: NodeId,
    /// Set when the worker failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAck {
    pub node_id: NodeId,
    pub accepted: bool,
    pub message: Option<String>,
}

impl NodeAck {
    pub fn accepted(node_id: NodeId) -> Self {
        Self {
            node_id,
            accepted: true,
            message: None,
        }
    }

    pub fn rejected(node_id: NodeId, reason: impl Into<String>) -> Self {
        Self {
            node_id,
            accepted: false,
            message: Some(reason.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Public body of `POST /models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModelRequest {
    pub model_id: Option<String>,
    pub name: String,
    /// Base64 payload.
    pub content: String,
}

/// Public body of `POST /models/:id/load` and `/unload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub node_ids: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub task_id: TaskId,
    pub state: String,
}
