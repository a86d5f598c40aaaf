use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

use super::ModelRuntime;
use crate::chunk::types::ModelMeta;
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone)]
struct ResidentModel {
    path: PathBuf,
    size_bytes: u64,
}

/// Runtime that keeps resident models as files under its own directory.
pub struct FileModelRuntime {
    model_dir: PathBuf,
    resident: DashMap<String, ResidentModel>,
}

impl FileModelRuntime {
    pub fn new(model_dir: PathBuf) -> Self {
        Self {
            model_dir,
            resident: DashMap::new(),
        }
    }

    fn resident_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(format!("{}.model", model_id))
    }
}

#[async_trait]
impl ModelRuntime for FileModelRuntime {
    async fn load(&self, artifact: &Path, model_id: &str, meta: &ModelMeta) -> Result<()> {
        let size_bytes = tokio::fs::metadata(artifact).await?.len();
        if size_bytes != meta.size_bytes {
            return Err(ClusterError::Runtime(format!(
                "model {} artifact is {} bytes, expected {}",
                model_id, size_bytes, meta.size_bytes
            )));
        }

        tokio::fs::create_dir_all(&self.model_dir).await?;
        let path = self.resident_path(model_id);
        tokio::fs::copy(artifact, &path).await?;

        self.resident.insert(
            model_id.to_string(),
            ResidentModel { path, size_bytes },
        );
        tracing::info!("Model {} resident ({} bytes)", model_id, size_bytes);
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<()> {
        let Some((_, model)) = self.resident.remove(model_id) else {
            tracing::debug!("Model {} was not resident", model_id);
            return Ok(());
        };

        match tokio::fs::remove_file(&model.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Model {} unloaded ({} bytes freed)", model_id, model.size_bytes);
        Ok(())
    }

    fn is_loaded(&self, model_id: &str) -> bool {
        self.resident.contains_key(model_id)
    }

    fn list_loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resident.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
