use sha2::{Digest, Sha256};

use super::types::{ModelChunk, ModelMeta, ModelState};
use crate::error::{ClusterError, Result};
use crate::store::ArtifactStore;

/// Cuts `payload` into `ceil(len / chunk_size)` chunks numbered from 0.
///
/// An empty payload yields no chunks.
pub fn split_into_chunks(model_id: &str, payload: &[u8], chunk_size: usize) -> Result<Vec<ModelChunk>> {
    if chunk_size == 0 {
        return Err(ClusterError::InvalidRequest("chunk size must be > 0".to_string()));
    }

    let total_chunks = u32::try_from(payload.len().div_ceil(chunk_size)).map_err(|_| {
        ClusterError::InvalidRequest(format!("model {} needs too many chunks", model_id))
    })?;

    Ok(payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, content)| ModelChunk {
            model_id: model_id.to_string(),
            index: index as u32,
            total_chunks,
            content: content.to_vec(),
        })
        .collect())
}

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Uploads a model: metadata first, then every chunk.
pub async fn register_model(
    store: &dyn ArtifactStore,
    model_id: &str,
    name: &str,
    payload: &[u8],
    chunk_size: usize,
) -> Result<ModelMeta> {
    let chunks = split_into_chunks(model_id, payload, chunk_size)?;
    if chunks.is_empty() {
        return Err(ClusterError::InvalidRequest(format!(
            "model {} has an empty payload",
            model_id
        )));
    }

    let meta = ModelMeta {
        model_id: model_id.to_string(),
        name: name.to_string(),
        total_chunks: chunks.len() as u32,
        content_hash: Some(content_hash(payload)),
        size_bytes: payload.len() as u64,
        state: ModelState::Registered,
        planning_worker_node_count: 0,
        current_worker_node_count: 0,
    };
    store.put_model_meta(&meta).await?;
    for chunk in &chunks {
        store.put_chunk(chunk).await?;
    }

    tracing::info!(
        "Registered model {} ({} bytes in {} chunks)",
        model_id,
        meta.size_bytes,
        meta.total_chunks
    );
    Ok(meta)
}
