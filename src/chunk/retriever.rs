//! Worker-side chunk retrieval.
//!
//! Chunks are pulled from the store one at a time, spooled to
//! `<cache>/<model>/chunks/<index>`, then merged in index order into
//! `<model>.bin`. Any failure removes everything written for the model.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

use crate::error::{ClusterError, Result};
use crate::store::SharedStore;

const CHUNK_DIR: &str = "chunks";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

pub struct ChunkRetriever {
    store: SharedStore,
    cache_dir: PathBuf,
    fetch_slot: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl ChunkRetriever {
    pub fn new(store: SharedStore, cache_dir: PathBuf, acquire_timeout: Duration) -> Self {
        Self {
            store,
            cache_dir,
            fetch_slot: Arc::new(Semaphore::new(1)),
            acquire_timeout,
        }
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    pub fn artifact_path(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(format!("{}.bin", model_id))
    }

    fn partial_path(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(format!("{}.bin.part", model_id))
    }

    fn chunk_dir(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(CHUNK_DIR)
    }

    /// Fetches `total_chunks` chunks and reassembles them into the local artifact.
    pub async fn retrieve_and_reassemble(&self, model_id: &str, total_chunks: u32) -> Result<PathBuf> {
        if total_chunks == 0 {
            return Err(ClusterError::Transfer(format!(
                "model {} declares no chunks",
                model_id
            )));
        }

        let meta = self.store.get_model_meta(model_id).await?;
        if meta.total_chunks != total_chunks {
            return Err(ClusterError::ChunkCountMismatch {
                model_id: model_id.to_string(),
                declared: total_chunks,
                stored: meta.total_chunks,
            });
        }

        match self.fetch_and_merge(model_id, total_chunks).await {
            Ok(path) => {
                tracing::info!("Reassembled model {} from {} chunks", model_id, total_chunks);
                Ok(path)
            }
            Err(e) => {
                tracing::warn!("Retrieval of model {} aborted: {}", model_id, e);
                self.discard(model_id).await;
                Err(e)
            }
        }
    }

    async fn fetch_and_merge(&self, model_id: &str, total_chunks: u32) -> Result<PathBuf> {
        let chunk_dir = self.chunk_dir(model_id);
        if tokio::fs::try_exists(&chunk_dir).await? {
            tokio::fs::remove_dir_all(&chunk_dir).await?;
        }
        tokio::fs::create_dir_all(&chunk_dir).await?;

        for index in 0..total_chunks {
            self.fetch_chunk(model_id, index, &chunk_dir).await?;
        }

        let partial = self.partial_path(model_id);
        let mut output = tokio::fs::File::create(&partial).await?;
        for index in 0..total_chunks {
            let content = tokio::fs::read(chunk_dir.join(index.to_string())).await?;
            output.write_all(&content).await?;
        }
        output.flush().await?;
        output.sync_all().await?;
        drop(output);

        let artifact = self.artifact_path(model_id);
        tokio::fs::rename(&partial, &artifact).await?;
        tokio::fs::remove_dir_all(&chunk_dir).await?;
        Ok(artifact)
    }

    async fn fetch_chunk(&self, model_id: &str, index: u32, chunk_dir: &Path) -> Result<()> {
        let _permit = tokio::time::timeout(self.acquire_timeout, self.fetch_slot.acquire())
            .await
            .map_err(|_| {
                ClusterError::Transfer(format!(
                    "timed out after {:?} waiting to fetch chunk {} of model {}",
                    self.acquire_timeout, index, model_id
                ))
            })?
            .map_err(|_| ClusterError::Transfer("chunk fetch slot closed".to_string()))?;

        let chunk = self
            .store
            .get_chunk(model_id, index)
            .await
            .map_err(|e| ClusterError::Transfer(format!("chunk {} of model {}: {}", index, model_id, e)))?;

        if chunk.index != index || chunk.model_id != model_id {
            return Err(ClusterError::Transfer(format!(
                "expected chunk {} of model {}, got chunk {} of model {}",
                index, model_id, chunk.index, chunk.model_id
            )));
        }

        tokio::fs::write(chunk_dir.join(index.to_string()), &chunk.content).await?;
        tracing::debug!(
            "Fetched chunk {}/{} of model {} ({} bytes)",
            index + 1,
            chunk.total_chunks,
            model_id,
            chunk.content.len()
        );
        Ok(())
    }

    /// Removes chunk files and any partial or complete artifact.
    async fn discard(&self, model_id: &str) {
        let chunk_dir = self.chunk_dir(model_id);
        for path in [self.partial_path(model_id), self.artifact_path(model_id)] {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&chunk_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {}: {}", chunk_dir.display(), e);
        }
    }

    /// Deletes the cached copy of a model. Missing cache entries are fine.
    pub async fn evict(&self, model_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.model_dir(model_id)).await {
            Ok(()) => {
                tracing::debug!("Evicted cached model {}", model_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Checks the artifact against the expected hex SHA-256, when one is known.
pub async fn verify_artifact(model_id: &str, path: &Path, expected_hash: Option<&str>) -> Result<()> {
    let Some(expected) = expected_hash else {
        return Ok(());
    };

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ClusterError::HashMismatch {
            model_id: model_id.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
