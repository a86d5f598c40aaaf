use serde::{Deserialize, Serialize};

/// One fixed-size slice of a model artifact.
///
/// Indices of one model form `[0, total_chunks)`. Chunks are immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelChunk {
    pub model_id: String,
    pub index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Registered,
    Loading,
    Loaded,
    PartiallyLoaded,
    LoadFailed,
    Unloaded,
}

impl ModelState {
    /// State implied by how many of the planned workers hold the model.
    pub fn from_worker_counts(current: u32, planning: u32) -> Self {
        if current == 0 {
            ModelState::LoadFailed
        } else if current < planning {
            ModelState::PartiallyLoaded
        } else {
            ModelState::Loaded
        }
    }
}

/// Store-side description of a registered model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelMeta {
    pub model_id: String,
    pub name: String,
    pub total_chunks: u32,
    /// Hex SHA-256 of the whole payload.
    pub content_hash: Option<String>,
    pub size_bytes: u64,
    pub state: ModelState,
    pub planning_worker_node_count: u32,
    pub current_worker_node_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelStateUpdate {
    pub state: ModelState,
    pub planning_worker_node_count: Option<u32>,
    pub current_worker_node_count: Option<u32>,
}

impl ModelStateUpdate {
    pub fn new(state: ModelState) -> Self {
        Self {
            state,
            planning_worker_node_count: None,
            current_worker_node_count: None,
        }
    }

    pub fn planning(mut self, count: u32) -> Self {
        self.planning_worker_node_count = Some(count);
        self
    }

    pub fn current(mut self, count: u32) -> Self {
        self.current_worker_node_count = Some(count);
        self
    }

    pub fn apply_to(&self, meta: &mut ModelMeta) {
        meta.state = self.state;
        if let Some(planning) = self.planning_worker_node_count {
            meta.planning_worker_node_count = planning;
        }
        if let Some(current) = self.current_worker_node_count {
            meta.current_worker_node_count = current;
        }
    }
}

/// Chunk bytes travel as base64 strings in JSON bodies.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
