use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use super::ArtifactStore;
use super::protocol::{
    ENDPOINT_STORE_CHUNKS, ENDPOINT_STORE_MODELS, ENDPOINT_STORE_TASKS, ListModelsResponse,
    PutTaskResponse, StoreAck, chunk_url, model_state_url, model_url, task_url,
};
use crate::chunk::types::{ModelChunk, ModelMeta, ModelStateUpdate};
use crate::error::{ClusterError, Result};
use crate::http::RetryingClient;
use crate::task::types::{MlTask, TaskId, TaskUpdate};

const STORE_ATTEMPTS: usize = 3;

/// Client for a store hosted by another node.
pub struct HttpArtifactStore {
    base_url: String,
    client: RetryingClient,
}

impl HttpArtifactStore {
    pub fn new(store_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            base_url: format!("http://{}", store_addr),
            client: RetryingClient::new(timeout),
        }
    }

    async fn post_ack<T: serde::Serialize + Sync + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let ack: StoreAck = self.client.post_json(url, body, STORE_ATTEMPTS).await?;
        if !ack.success {
            return Err(ClusterError::Store(format!("{} was not acknowledged", url)));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn get_model_meta(&self, model_id: &str) -> Result<ModelMeta> {
        self.client
            .get_json(&model_url(&self.base_url, model_id), STORE_ATTEMPTS)
            .await?
            .ok_or_else(|| ClusterError::ModelNotFound(model_id.to_string()))
    }

    async fn get_chunk(&self, model_id: &str, index: u32) -> Result<ModelChunk> {
        self.client
            .get_json(&chunk_url(&self.base_url, model_id, index), STORE_ATTEMPTS)
            .await?
            .ok_or_else(|| {
                ClusterError::Store(format!("chunk {} of model {} not found", index, model_id))
            })
    }

    async fn put_model_meta(&self, meta: &ModelMeta) -> Result<()> {
        let url = format!("{}{}", self.base_url, ENDPOINT_STORE_MODELS);
        self.post_ack(&url, meta).await
    }

    async fn put_chunk(&self, chunk: &ModelChunk) -> Result<()> {
        let url = format!("{}{}", self.base_url, ENDPOINT_STORE_CHUNKS);
        self.post_ack(&url, chunk).await
    }

    async fn update_model_state(&self, model_id: &str, update: &ModelStateUpdate) -> Result<()> {
        self.post_ack(&model_state_url(&self.base_url, model_id), update)
            .await
    }

    async fn list_models(&self) -> Result<Vec<ModelMeta>> {
        let url = format!("{}{}", self.base_url, ENDPOINT_STORE_MODELS);
        let response: Option<ListModelsResponse> =
            self.client.get_json(&url, STORE_ATTEMPTS).await?;
        Ok(response.map(|r| r.models).unwrap_or_default())
    }

    async fn put_task_record(&self, task: &MlTask) -> Result<TaskId> {
        let url = format!("{}{}", self.base_url, ENDPOINT_STORE_TASKS);
        let response: PutTaskResponse = self.client.post_json(&url, task, STORE_ATTEMPTS).await?;
        Ok(response.task_id)
    }

    async fn update_task_record(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<()> {
        self.post_ack(&task_url(&self.base_url, task_id), update)
            .await
    }

    async fn get_task_record(&self, task_id: &TaskId) -> Result<Option<MlTask>> {
        self.client
            .get_json(&task_url(&self.base_url, task_id), STORE_ATTEMPTS)
            .await
    }
}
