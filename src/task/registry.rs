//! Per-node task registry.
//!
//! Holds the in-memory copy of every non-terminal task this node coordinates
//! or works on. Updates to one task are serialized by a per-task binary
//! semaphore acquired with a timeout; the coordinator's copy is also written
//! through to the artifact store.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::types::{MlTask, TaskId, TaskState, TaskStatusCounts, TaskType, TaskUpdate};
use crate::error::{ClusterError, Result};
use crate::membership::types::NodeId;
use crate::store::SharedStore;

struct TaskCache {
    task: MlTask,
    /// Workers that have not reported back yet.
    pending_workers: BTreeSet<NodeId>,
    update_lock: Arc<Semaphore>,
}

/// Outcome of one worker's report.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The task is unknown, already terminal, or the worker already reported.
    Duplicate,
    Pending { remaining: usize },
    /// Last worker reported; the task reached its terminal state and left the registry.
    Finished(MlTask),
}

pub struct TaskRegistry {
    local_node: NodeId,
    tasks: DashMap<TaskId, TaskCache>,
    store: SharedStore,
    update_timeout: Duration,
    admission: Mutex<()>,
}

impl TaskRegistry {
    pub fn new(local_node: NodeId, store: SharedStore, update_timeout: Duration) -> Self {
        Self {
            local_node,
            tasks: DashMap::new(),
            store,
            update_timeout,
            admission: Mutex::new(()),
        }
    }

    pub fn update_timeout(&self) -> Duration {
        self.update_timeout
    }

    /// Persists a new task record.
    pub async fn create_task(&self, task: &MlTask) -> Result<TaskId> {
        let task_id = self.store.put_task_record(task).await?;
        tracing::debug!("Persisted task {} for model {}", task_id, task.model_id);
        Ok(task_id)
    }

    /// Caches a task with the workers it waits on. A task already cached is left as is.
    pub fn add_task(&self, task: MlTask, worker_nodes: BTreeSet<NodeId>) {
        let task_id = task.task_id.clone();
        self.tasks.entry(task_id).or_insert_with(|| TaskCache {
            task,
            pending_workers: worker_nodes,
            update_lock: Arc::new(Semaphore::new(1)),
        });
    }

    /// Adds the task unless `limit` tasks of the same type are already
    /// running, or one of them is already working on the same model.
    pub async fn check_limit_and_add(
        &self,
        task: MlTask,
        worker_nodes: BTreeSet<NodeId>,
        limit: usize,
    ) -> Result<()> {
        let _admission = self.admission.lock().await;
        if self.contains_model(&task.model_id, task.task_type) {
            tracing::warn!(
                "Rejecting task {}: model {} already has a {:?} task in progress",
                task.task_id,
                task.model_id,
                task.task_type
            );
            return Err(ClusterError::ModelBusy {
                model_id: task.model_id.clone(),
                task_type: task.task_type,
            });
        }
        let running = self.running_tasks_of_type(task.task_type).len();
        if running >= limit {
            tracing::warn!(
                "Rejecting task {}: {} {:?} tasks already running",
                task.task_id,
                running,
                task.task_type
            );
            return Err(ClusterError::TooManyRunningTasks {
                task_type: task.task_type,
                limit,
            });
        }
        self.add_task(task, worker_nodes);
        Ok(())
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<MlTask> {
        self.tasks.get(task_id).map(|entry| entry.task.clone())
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Whether a non-terminal task of `task_type` exists for `model_id`.
    pub fn contains_model(&self, model_id: &str, task_type: TaskType) -> bool {
        self.tasks.iter().any(|entry| {
            entry.task.model_id == model_id
                && entry.task.task_type == task_type
                && !entry.task.state.is_terminal()
        })
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<MlTask> {
        self.tasks.iter().map(|entry| entry.task.clone()).collect()
    }

    /// Removes a terminal task from the cache.
    pub fn remove_task(&self, task_id: &TaskId) -> Result<MlTask> {
        let removed = self
            .tasks
            .remove_if(task_id, |_, cache| cache.task.state.is_terminal());
        match removed {
            Some((_, cache)) => {
                cache.update_lock.close();
                Ok(cache.task)
            }
            None if self.tasks.contains_key(task_id) => {
                Err(ClusterError::TaskNotTerminal(task_id.to_string()))
            }
            None => Err(ClusterError::TaskNotFound(task_id.to_string())),
        }
    }

    pub fn add_worker_nodes(&self, task_id: &TaskId, nodes: &[NodeId]) -> Result<()> {
        let mut cache = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ClusterError::TaskNotFound(task_id.to_string()))?;
        for node in nodes {
            cache.task.worker_nodes.insert(node.clone());
            cache.pending_workers.insert(node.clone());
        }
        Ok(())
    }

    pub fn pending_worker_nodes(&self, task_id: &TaskId) -> Option<BTreeSet<NodeId>> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.pending_workers.clone())
    }

    pub fn running_tasks_of_type(&self, task_type: TaskType) -> Vec<MlTask> {
        self.tasks
            .iter()
            .filter(|entry| entry.task.task_type == task_type && !entry.task.state.is_terminal())
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Tasks in `Running` state.
    pub fn running_tasks(&self) -> Vec<MlTask> {
        self.tasks
            .iter()
            .filter(|entry| entry.task.state == TaskState::Running)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn status_counts(&self) -> TaskStatusCounts {
        let mut counts = TaskStatusCounts::default();
        for entry in self.tasks.iter() {
            match entry.task.state {
                TaskState::Created => counts.created += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::CompletedWithError => counts.completed_with_error += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Applies a partial update under the task's lock.
    ///
    /// Gives up with `UpdateTimeout` when the lock is not acquired within
    /// `timeout`. Re-applying the current terminal state is a no-op.
    pub async fn update_task(
        &self,
        task_id: &TaskId,
        update: TaskUpdate,
        timeout: Duration,
        remove_on_terminal: bool,
    ) -> Result<MlTask> {
        let _permit = self.lock(task_id, timeout).await?;

        let (task, changed) = {
            let mut cache = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ClusterError::TaskNotFound(task_id.to_string()))?;
            let changed = cache.task.apply(&update)?;
            (cache.task.clone(), changed)
        };

        if changed {
            self.persist(&task, &update, timeout).await;
        }
        if remove_on_terminal
            && task.state.is_terminal()
            && let Some((_, cache)) = self.tasks.remove(task_id)
        {
            cache.update_lock.close();
        }
        Ok(task)
    }

    /// Records one worker's report and finalizes the task when it was the last.
    ///
    /// No failures -> `Completed`, only failures -> `Failed`, otherwise
    /// `CompletedWithError`.
    pub async fn record_worker_result(
        &self,
        task_id: &TaskId,
        worker: &NodeId,
        error: Option<String>,
        timeout: Duration,
    ) -> Result<WorkerOutcome> {
        let permit = match self.lock(task_id, timeout).await {
            Ok(permit) => permit,
            Err(ClusterError::TaskNotFound(_)) => return Ok(WorkerOutcome::Duplicate),
            Err(e) => return Err(e),
        };

        let (task, update) = {
            let Some(mut cache) = self.tasks.get_mut(task_id) else {
                return Ok(WorkerOutcome::Duplicate);
            };
            if cache.task.state.is_terminal() || !cache.pending_workers.remove(worker) {
                return Ok(WorkerOutcome::Duplicate);
            }
            if let Some(error) = &error {
                cache.task.node_errors.insert(worker.clone(), error.clone());
            }
            if !cache.pending_workers.is_empty() {
                return Ok(WorkerOutcome::Pending {
                    remaining: cache.pending_workers.len(),
                });
            }

            let update = final_update(&cache.task);
            cache.task.apply(&update)?;
            (cache.task.clone(), update)
        };

        self.persist(&task, &update, timeout).await;
        drop(permit);
        if let Some((_, cache)) = self.tasks.remove(task_id) {
            cache.update_lock.close();
        }
        tracing::info!(
            "Task {} for model {} finished as {:?}",
            task.task_id,
            task.model_id,
            task.state
        );
        Ok(WorkerOutcome::Finished(task))
    }

    async fn lock(&self, task_id: &TaskId, timeout: Duration) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .tasks
            .get(task_id)
            .map(|entry| entry.update_lock.clone())
            .ok_or_else(|| ClusterError::TaskNotFound(task_id.to_string()))?;

        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // closed: the task left the registry while we waited
            Ok(Err(_)) => Err(ClusterError::TaskNotFound(task_id.to_string())),
            Err(_) => {
                tracing::warn!(
                    "Abandoning update of task {}: lock not acquired within {:?}",
                    task_id,
                    timeout
                );
                Err(ClusterError::UpdateTimeout {
                    task_id: task_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Writes the update through to the store when this node coordinates the task.
    async fn persist(&self, task: &MlTask, update: &TaskUpdate, timeout: Duration) {
        if task.coordinating_node != self.local_node {
            return;
        }
        let write = self.store.update_task_record(&task.task_id, update);
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Failed to persist update of task {}: {}", task.task_id, e)
            }
            Err(_) => tracing::error!("Persisting update of task {} timed out", task.task_id),
        }
    }
}

fn final_update(task: &MlTask) -> TaskUpdate {
    let failures = task.node_errors.len();
    if failures == 0 {
        return TaskUpdate::state(TaskState::Completed);
    }

    let summary = task
        .node_errors
        .iter()
        .map(|(node, error)| format!("{}: {}", node, error))
        .collect::<Vec<_>>()
        .join("; ");
    let mut update = if failures >= task.worker_nodes.len() {
        TaskUpdate::failed(summary)
    } else {
        TaskUpdate::state(TaskState::CompletedWithError).with_error(summary)
    };
    update.node_errors = task.node_errors.clone();
    update
}
