//! Node configuration.
//!
//! Every section has working defaults so a node can start with no file at all.
//! A TOML file may override any subset of fields; CLI flags in `main.rs` are
//! applied on top of that.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub placement: PlacementConfig,
    pub task: TaskConfig,
    pub chunk: ChunkConfig,
    pub dispatch: DispatchConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Use data nodes when the cluster has no dedicated ML nodes.
    pub allow_data_node_fallback: bool,
    /// Node names that never host models.
    pub exclude_node_names: Vec<String>,
    /// Restrict placement to nodes tagged with this group.
    pub placement_group: Option<String>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            allow_data_node_fallback: true,
            exclude_node_names: Vec::new(),
            placement_group: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub update_timeout_ms: u64,
    pub max_running_load_tasks: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            update_timeout_ms: 5_000,
            max_running_load_tasks: 10,
        }
    }
}

impl TaskConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub chunk_size_bytes: usize,
    /// Upper bound on waiting for the chunk fetch slot.
    pub acquire_timeout_ms: u64,
    pub cache_dir: PathBuf,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 10 * 1024 * 1024,
            acquire_timeout_ms: 10_000,
            cache_dir: PathBuf::from("./model-cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent load/unload jobs on one worker.
    pub worker_threads: usize,
    pub request_timeout_ms: u64,
    pub forward_attempts: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            request_timeout_ms: 10_000,
            forward_attempts: 3,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What a sync pass does with a RUNNING task that no node is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanedTaskPolicy {
    /// Mark it FAILED and drop it from the registry.
    Fail,
    /// Leave it RUNNING; only log it.
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub request_timeout_ms: u64,
    pub orphaned_task_policy: OrphanedTaskPolicy,
    /// Tasks and models touched more recently than this are left alone.
    pub orphan_grace_ms: u64,
    /// Rebuild the routing table from scratch after a membership change.
    pub clear_on_membership_change: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            request_timeout_ms: 3_000,
            orphaned_task_policy: OrphanedTaskPolicy::Fail,
            orphan_grace_ms: 10_000,
            clear_on_membership_change: false,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk.chunk_size_bytes == 0 {
            return Err(ClusterError::Config("chunk.chunk_size_bytes must be > 0".into()));
        }
        if self.chunk.acquire_timeout_ms == 0 {
            return Err(ClusterError::Config("chunk.acquire_timeout_ms must be > 0".into()));
        }
        if self.dispatch.worker_threads == 0 {
            return Err(ClusterError::Config("dispatch.worker_threads must be > 0".into()));
        }
        if self.sync.interval_secs == 0 {
            return Err(ClusterError::Config("sync.interval_secs must be > 0".into()));
        }
        if self.task.update_timeout_ms == 0 {
            return Err(ClusterError::Config("task.update_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}
