use async_trait::async_trait;
use dashmap::DashMap;

use super::ArtifactStore;
use crate::chunk::types::{ModelChunk, ModelMeta, ModelStateUpdate};
use crate::error::{ClusterError, Result};
use crate::task::types::{MlTask, TaskId, TaskUpdate};

/// In-process artifact store.
///
/// One node hosts it and serves it over `/store`; tests use it directly.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    models: DashMap<String, ModelMeta>,
    chunks: DashMap<(String, u32), ModelChunk>,
    tasks: DashMap<TaskId, MlTask>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn task_records(&self) -> Vec<MlTask> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    #[cfg(test)]
    pub fn chunk_count(&self, model_id: &str) -> usize {
        self.chunks
            .iter()
            .filter(|entry| entry.key().0 == model_id)
            .count()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn get_model_meta(&self, model_id: &str) -> Result<ModelMeta> {
        self.models
            .get(model_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::ModelNotFound(model_id.to_string()))
    }

    async fn get_chunk(&self, model_id: &str, index: u32) -> Result<ModelChunk> {
        self.chunks
            .get(&(model_id.to_string(), index))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ClusterError::Store(format!("chunk {} of model {} not found", index, model_id))
            })
    }

    async fn put_model_meta(&self, meta: &ModelMeta) -> Result<()> {
        self.models.insert(meta.model_id.clone(), meta.clone());
        Ok(())
    }

    async fn put_chunk(&self, chunk: &ModelChunk) -> Result<()> {
        let key = (chunk.model_id.clone(), chunk.index);
        if self.chunks.contains_key(&key) {
            return Err(ClusterError::Store(format!(
                "chunk {} of model {} already exists",
                chunk.index, chunk.model_id
            )));
        }
        self.chunks.insert(key, chunk.clone());
        Ok(())
    }

    async fn update_model_state(&self, model_id: &str, update: &ModelStateUpdate) -> Result<()> {
        let mut meta = self
            .models
            .get_mut(model_id)
            .ok_or_else(|| ClusterError::ModelNotFound(model_id.to_string()))?;
        update.apply_to(&mut meta);
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelMeta>> {
        let mut models: Vec<ModelMeta> =
            self.models.iter().map(|entry| entry.value().clone()).collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    async fn put_task_record(&self, task: &MlTask) -> Result<TaskId> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task.task_id.clone())
    }

    async fn update_task_record(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<()> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ClusterError::TaskNotFound(task_id.to_string()))?;
        record.apply(update)?;
        Ok(())
    }

    async fn get_task_record(&self, task_id: &TaskId) -> Result<Option<MlTask>> {
        Ok(self.tasks.get(task_id).map(|entry| entry.value().clone()))
    }
}
