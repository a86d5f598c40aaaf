//! Model runtime interface.
//!
//! The runtime is what actually executes a model; the cluster only asks it to
//! take a reassembled artifact into residence, drop it, and say what it holds.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::chunk::types::ModelMeta;
use crate::error::Result;

pub mod file;

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load(&self, artifact: &Path, model_id: &str, meta: &ModelMeta) -> Result<()>;

    /// Unloading a model that is not resident succeeds.
    async fn unload(&self, model_id: &str) -> Result<()>;

    fn is_loaded(&self, model_id: &str) -> bool;

    fn list_loaded(&self) -> Vec<String>;
}

pub type SharedRuntime = Arc<dyn ModelRuntime>;
