//! Artifact Store Module
//!
//! The durable side of the system: model metadata, model chunks and task
//! records. The core only talks to the [`ArtifactStore`] trait.
//!
//! ## Implementations
//! - **`memory`**: `DashMap`-backed store hosted by one node.
//! - **`remote`**: HTTP client used by every other node to reach the host.
//! - **`handlers`**: axum routes the host exposes under `/store`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::chunk::types::{ModelChunk, ModelMeta, ModelStateUpdate};
use crate::error::Result;
use crate::task::types::{MlTask, TaskId, TaskUpdate};

pub mod handlers;
pub mod memory;
pub mod protocol;
pub mod remote;

#[cfg(test)]
mod tests;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fails with `ModelNotFound` for an unknown id.
    async fn get_model_meta(&self, model_id: &str) -> Result<ModelMeta>;

    async fn get_chunk(&self, model_id: &str, index: u32) -> Result<ModelChunk>;

    async fn put_model_meta(&self, meta: &ModelMeta) -> Result<()>;

    async fn put_chunk(&self, chunk: &ModelChunk) -> Result<()>;

    async fn update_model_state(&self, model_id: &str, update: &ModelStateUpdate) -> Result<()>;

    async fn list_models(&self) -> Result<Vec<ModelMeta>>;

    /// Persists a new task record and returns the id it was stored under.
    async fn put_task_record(&self, task: &MlTask) -> Result<TaskId>;

    async fn update_task_record(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<()>;

    async fn get_task_record(&self, task_id: &TaskId) -> Result<Option<MlTask>>;
}

pub type SharedStore = Arc<dyn ArtifactStore>;
