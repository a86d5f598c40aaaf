//! Error types shared by every cluster component.
//!
//! Failures that happen on a worker (chunk fetch, runtime load) are turned into
//! strings and attached to the task they belong to; this enum is what flows
//! through local call chains and HTTP handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::types::{TaskState, TaskType};

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Placement found nothing to dispatch to.
    #[error("no eligible node found")]
    NoEligibleNodes,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("illegal transition for task {task_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {0} is already done and can no longer change")]
    TaskTerminal(String),

    #[error("task {0} is still in progress")]
    TaskNotTerminal(String),

    #[error("exceed max running task limit ({limit}) for {task_type:?}")]
    TooManyRunningTasks { task_type: TaskType, limit: usize },

    #[error("model {model_id} already has a {task_type:?} task in progress")]
    ModelBusy { model_id: String, task_type: TaskType },

    #[error("gave up updating task {task_id} after {timeout_ms}ms")]
    UpdateTimeout { task_id: String, timeout_ms: u64 },

    /// Chunk fetch, chunk write or reassembly failure.
    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("model {model_id} declares {declared} chunks but the store holds {stored}")]
    ChunkCountMismatch {
        model_id: String,
        declared: u32,
        stored: u32,
    },

    #[error("content hash mismatch for model {model_id}: expected {expected}, got {actual}")]
    HashMismatch {
        model_id: String,
        expected: String,
        actual: String,
    },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a sync pass is already running")]
    SyncInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(e: toml::de::Error) -> Self {
        ClusterError::Config(e.to_string())
    }
}

impl ClusterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::NoEligibleNodes
            | ClusterError::ModelNotFound(_)
            | ClusterError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::InvalidRequest(_)
            | ClusterError::IllegalTransition { .. }
            | ClusterError::TaskTerminal(_)
            | ClusterError::TaskNotTerminal(_) => StatusCode::BAD_REQUEST,
            ClusterError::TooManyRunningTasks { .. } => StatusCode::TOO_MANY_REQUESTS,
            ClusterError::SyncInProgress | ClusterError::ModelBusy { .. } => StatusCode::CONFLICT,
            ClusterError::UpdateTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body returned by every failing HTTP handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
