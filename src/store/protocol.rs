//! Store Network Protocol
//!
//! Endpoints and DTOs the store host serves to the rest of the cluster.

use serde::{Deserialize, Serialize};

use crate::chunk::types::ModelMeta;
use crate::task::types::TaskId;

pub const ENDPOINT_STORE_MODELS: &str = "/store/models";
pub const ENDPOINT_STORE_CHUNKS: &str = "/store/chunks";
pub const ENDPOINT_STORE_TASKS: &str = "/store/tasks";

pub fn model_url(base: &str, model_id: &str) -> String {
    format!("{}{}/{}", base, ENDPOINT_STORE_MODELS, model_id)
}

pub fn model_state_url(base: &str, model_id: &str) -> String {
    format!("{}/state", model_url(base, model_id))
}

pub fn chunk_url(base: &str, model_id: &str, index: u32) -> String {
    format!("{}/chunks/{}", model_url(base, model_id), index)
}

pub fn task_url(base: &str, task_id: &TaskId) -> String {
    format!("{}{}/{}", base, ENDPOINT_STORE_TASKS, task_id)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreAck {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutTaskResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelMeta>,
}
