//! Coordinator/worker dispatch.
//!
//! One `ModelDispatcher` runs on every node. It acts as coordinator for tasks
//! whose `coordinating_node` is the local node and as worker for everything
//! it receives over the transport.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::protocol::{ForwardInput, ForwardKind, LoadModelInput, NodeAck, UnloadModelInput};
use crate::chunk::retriever::{ChunkRetriever, verify_artifact};
use crate::chunk::types::{ModelMeta, ModelState, ModelStateUpdate};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::membership::provider::MembershipProvider;
use crate::membership::types::{Node, NodeId};
use crate::placement::selector::{EligibilitySelector, filter_target_nodes};
use crate::profile::aggregator::local_profile;
use crate::profile::types::{NodeProfile, ProfileFilter};
use crate::routing::RoutingTable;
use crate::runtime::SharedRuntime;
use crate::store::SharedStore;
use crate::sync::types::SyncState;
use crate::task::registry::{TaskRegistry, WorkerOutcome};
use crate::task::types::{MlTask, TaskId, TaskState, TaskType, TaskUpdate};
use crate::transport::{ClusterMessage, ClusterReply, SharedTransport, fan_out};

/// Collaborators a node is built from.
#[derive(Clone)]
pub struct NodeComponents {
    pub membership: Arc<dyn MembershipProvider>,
    pub transport: SharedTransport,
    pub store: SharedStore,
    pub runtime: SharedRuntime,
}

/// The job this node is executing as a worker for one model.
#[derive(Debug, Clone)]
struct InFlight {
    task_id: TaskId,
    task_type: TaskType,
}

pub struct ModelDispatcher {
    membership: Arc<dyn MembershipProvider>,
    transport: SharedTransport,
    store: SharedStore,
    runtime: SharedRuntime,
    tasks: Arc<TaskRegistry>,
    routing: Arc<RoutingTable>,
    retriever: ChunkRetriever,
    selector: EligibilitySelector,
    worker_pool: Arc<Semaphore>,
    /// Keyed by model id: a model's cache directory belongs to one job at a time.
    in_flight: DashMap<String, InFlight>,
    max_running_load_tasks: usize,
    request_timeout: Duration,
    update_timeout: Duration,
}

impl ModelDispatcher {
    pub fn new(
        config: &ClusterConfig,
        components: NodeComponents,
        tasks: Arc<TaskRegistry>,
        routing: Arc<RoutingTable>,
    ) -> Arc<Self> {
        let retriever = ChunkRetriever::new(
            components.store.clone(),
            config.chunk.cache_dir.clone(),
            Duration::from_millis(config.chunk.acquire_timeout_ms),
        );

        Arc::new(Self {
            membership: components.membership,
            transport: components.transport,
            store: components.store,
            runtime: components.runtime,
            tasks,
            routing,
            retriever,
            selector: EligibilitySelector::new(config.placement.clone()),
            worker_pool: Arc::new(Semaphore::new(config.dispatch.worker_threads)),
            in_flight: DashMap::new(),
            max_running_load_tasks: config.task.max_running_load_tasks,
            request_timeout: config.dispatch.request_timeout(),
            update_timeout: config.task.update_timeout(),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.membership.local_node_id()
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    // ------------------------------------------------------------
    // Coordinator side
    // ------------------------------------------------------------

    /// Starts loading `model_id` and returns the task id right away.
    ///
    /// Placement runs before the task exists, so a cluster with no eligible
    /// node leaves no task behind.
    pub async fn dispatch_load(
        self: &Arc<Self>,
        model_id: &str,
        target_nodes: Option<Vec<NodeId>>,
    ) -> Result<TaskId> {
        let meta = self.store.get_model_meta(model_id).await?;
        if meta.total_chunks == 0 {
            return Err(ClusterError::InvalidRequest(format!(
                "model {} has no content",
                model_id
            )));
        }

        let eligible = self
            .selector
            .select_eligible_nodes(&self.membership.current_nodes())?;
        let targets = filter_target_nodes(
            &eligible,
            target_nodes.as_deref(),
            &self.routing.workers(model_id),
        )?;

        let task = MlTask::new(model_id, TaskType::LoadModel, self.local_node_id())
            .with_workers(targets.clone());
        let task_id = task.task_id.clone();

        self.tasks
            .check_limit_and_add(task.clone(), targets.clone(), self.max_running_load_tasks)
            .await?;
        if let Err(e) = self.tasks.create_task(&task).await {
            self.abandon(&task_id, &e).await;
            return Err(e);
        }

        tracing::info!(
            "Dispatching load of model {} to {} node(s) as task {}",
            model_id,
            targets.len(),
            task_id
        );
        let this = self.clone();
        tokio::spawn(async move { this.fan_out_load(task, meta).await });

        Ok(task_id)
    }

    /// Starts unloading `model_id` from the nodes routed for it.
    ///
    /// When the model is not routed anywhere every alive node is asked.
    pub async fn dispatch_unload(
        self: &Arc<Self>,
        model_id: &str,
        node_ids: Option<Vec<NodeId>>,
    ) -> Result<TaskId> {
        self.store.get_model_meta(model_id).await?;

        let alive: BTreeSet<NodeId> = self
            .membership
            .current_nodes()
            .into_iter()
            .map(|node| node.id)
            .collect();
        let routed = self.routing.workers(model_id);
        let mut targets: BTreeSet<NodeId> = if routed.is_empty() {
            alive
        } else {
            routed.intersection(&alive).cloned().collect()
        };
        if let Some(requested) = node_ids {
            let requested: BTreeSet<NodeId> = requested.into_iter().collect();
            targets.retain(|node| requested.contains(node));
        }
        if targets.is_empty() {
            return Err(ClusterError::NoEligibleNodes);
        }

        let task = MlTask::new(model_id, TaskType::UnloadModel, self.local_node_id())
            .with_workers(targets.clone());
        let task_id = task.task_id.clone();

        self.tasks.add_task(task.clone(), targets.clone());
        if let Err(e) = self.tasks.create_task(&task).await {
            self.abandon(&task_id, &e).await;
            return Err(e);
        }

        tracing::info!(
            "Dispatching unload of model {} from {} node(s) as task {}",
            model_id,
            targets.len(),
            task_id
        );
        let this = self.clone();
        tokio::spawn(async move { this.fan_out_unload(task).await });

        Ok(task_id)
    }

    async fn fan_out_load(self: Arc<Self>, task: MlTask, meta: ModelMeta) {
        let Some(task) = self.mark_running(&task).await else {
            return;
        };

        let planning = task.worker_nodes.len() as u32;
        let loading = ModelStateUpdate::new(ModelState::Loading).planning(planning);
        if let Err(e) = self.store.update_model_state(&task.model_id, &loading).await {
            tracing::warn!("Failed to mark model {} as loading: {}", task.model_id, e);
        }

        let input = LoadModelInput {
            model_id: task.model_id.clone(),
            task_id: task.task_id.clone(),
            worker_node_count: task.worker_nodes.len(),
            coordinating_node: task.coordinating_node.clone(),
            task: task.clone(),
            total_chunks: meta.total_chunks,
            content_hash: meta.content_hash.clone(),
        };
        self.send_to_workers(&task, ClusterMessage::LoadModel(input))
            .await;
    }

    async fn fan_out_unload(self: Arc<Self>, task: MlTask) {
        let Some(task) = self.mark_running(&task).await else {
            return;
        };

        let input = UnloadModelInput {
            model_id: task.model_id.clone(),
            task_id: task.task_id.clone(),
            coordinating_node: task.coordinating_node.clone(),
            task: task.clone(),
        };
        self.send_to_workers(&task, ClusterMessage::UnloadModel(input))
            .await;
    }

    async fn mark_running(&self, task: &MlTask) -> Option<MlTask> {
        match self
            .tasks
            .update_task(
                &task.task_id,
                TaskUpdate::state(TaskState::Running),
                self.update_timeout,
                false,
            )
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::error!("Task {} could not start: {}", task.task_id, e);
                None
            }
        }
    }

    /// Sends a job to every worker of `task`; workers that cannot be reached
    /// are reported as failed straight away.
    async fn send_to_workers(&self, task: &MlTask, message: ClusterMessage) {
        let mut targets: Vec<Node> = Vec::new();
        let mut undeliverable: Vec<(NodeId, String)> = Vec::new();
        for worker in &task.worker_nodes {
            match self.membership.get_member(worker) {
                Some(node) => targets.push(node),
                None => undeliverable.push((worker.clone(), "node left the cluster".to_string())),
            }
        }

        let result = fan_out(
            self.transport.as_ref(),
            &targets,
            message,
            self.request_timeout,
            ClusterReply::into_ack,
        )
        .await;

        for (node, ack) in result.successes {
            if !ack.accepted {
                let reason = ack.message.unwrap_or_else(|| "rejected".to_string());
                undeliverable.push((node, reason));
            }
        }
        undeliverable.extend(result.failures);

        for (node, error) in undeliverable {
            let error = format!("failed to dispatch to {}: {}", node, error);
            self.record_result(task.task_type, &task.task_id, &task.model_id, &node, Some(error))
                .await;
        }
    }

    /// Forward handling at the coordinator. Unknown, finished and duplicate
    /// reports are acknowledged and ignored.
    pub async fn on_forward(&self, input: ForwardInput) -> Result<NodeAck> {
        let ack = NodeAck::accepted(self.local_node_id());

        let pending = match self.tasks.get_task(&input.task_id) {
            Some(task) if !task.state.is_terminal() => self
                .tasks
                .pending_worker_nodes(&input.task_id)
                .unwrap_or_default(),
            _ => {
                tracing::debug!("Ignoring forward for finished task {}", input.task_id);
                return Ok(ack.with_message("task not active"));
            }
        };
        if !pending.contains(&input.worker_node) {
            tracing::debug!(
                "Ignoring duplicate forward from {} for task {}",
                input.worker_node,
                input.task_id
            );
            return Ok(ack.with_message("duplicate"));
        }

        let task_type = match input.kind {
            ForwardKind::LoadModelDone => TaskType::LoadModel,
            ForwardKind::UnloadModelDone => TaskType::UnloadModel,
        };
        self.record_result(
            task_type,
            &input.task_id,
            &input.model_id,
            &input.worker_node,
            input.error,
        )
        .await;
        Ok(ack)
    }

    async fn record_result(
        &self,
        task_type: TaskType,
        task_id: &TaskId,
        model_id: &str,
        worker: &NodeId,
        error: Option<String>,
    ) {
        match &error {
            None => match task_type {
                TaskType::LoadModel => {
                    self.routing.add(model_id, worker);
                }
                TaskType::UnloadModel => {
                    self.routing.remove(model_id, worker);
                }
                _ => {}
            },
            Some(error) => {
                tracing::warn!("Worker {} failed task {}: {}", worker, task_id, error);
            }
        }

        match self
            .tasks
            .record_worker_result(task_id, worker, error, self.update_timeout)
            .await
        {
            Ok(WorkerOutcome::Finished(task)) => self.refresh_model_state(&task).await,
            Ok(WorkerOutcome::Pending { remaining }) => {
                tracing::debug!("Task {} waiting on {} worker(s)", task_id, remaining);
            }
            Ok(WorkerOutcome::Duplicate) => {}
            Err(e) => tracing::error!("Failed to record result of task {}: {}", task_id, e),
        }
    }

    async fn refresh_model_state(&self, task: &MlTask) {
        let current = self.routing.worker_count(&task.model_id) as u32;
        let update = match task.task_type {
            TaskType::LoadModel => {
                let planning = task.worker_nodes.len() as u32;
                ModelStateUpdate::new(ModelState::from_worker_counts(current, planning))
                    .current(current)
            }
            TaskType::UnloadModel if current == 0 => ModelStateUpdate::new(ModelState::Unloaded)
                .planning(0)
                .current(0),
            TaskType::UnloadModel => {
                ModelStateUpdate::new(ModelState::PartiallyLoaded).current(current)
            }
            _ => return,
        };

        if let Err(e) = self.store.update_model_state(&task.model_id, &update).await {
            tracing::warn!("Failed to update state of model {}: {}", task.model_id, e);
        }
    }

    async fn abandon(&self, task_id: &TaskId, cause: &ClusterError) {
        let update = TaskUpdate::failed(cause.to_string());
        if let Err(e) = self
            .tasks
            .update_task(task_id, update, self.update_timeout, true)
            .await
        {
            tracing::error!("Failed to abandon task {}: {}", task_id, e);
        }
    }

    /// Task from the local registry, or the persisted record once it has left it.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<MlTask> {
        if let Some(task) = self.tasks.get_task(task_id) {
            return Ok(task);
        }
        self.store
            .get_task_record(task_id)
            .await?
            .ok_or_else(|| ClusterError::TaskNotFound(task_id.to_string()))
    }

    // ------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------

    pub fn on_load_model_input(self: &Arc<Self>, input: LoadModelInput) -> NodeAck {
        let this = self.clone();
        let job_input = input.clone();
        self.accept(input.task, ForwardKind::LoadModelDone, async move {
            this.load_locally(&job_input).await
        })
    }

    pub fn on_unload_model_input(self: &Arc<Self>, input: UnloadModelInput) -> NodeAck {
        let this = self.clone();
        let model_id = input.model_id.clone();
        self.accept(input.task, ForwardKind::UnloadModelDone, async move {
            this.runtime.unload(&model_id).await?;
            this.retriever.evict(&model_id).await
        })
    }

    /// Registers the job as in flight and runs it on the worker pool.
    ///
    /// A job for a model that already has a different job running here is
    /// rejected; the coordinator records the rejection as this node's error.
    fn accept<F>(self: &Arc<Self>, task: MlTask, kind: ForwardKind, job: F) -> NodeAck
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let local = self.local_node_id();
        match self.in_flight.entry(task.model_id.clone()) {
            Entry::Occupied(current) if current.get().task_id == task.task_id => {
                tracing::debug!("Task {} already in flight here", task.task_id);
                return NodeAck::accepted(local).with_message("already in progress");
            }
            Entry::Occupied(current) => {
                let busy = current.get();
                tracing::warn!(
                    "Rejecting task {}: model {} is busy with {:?} task {}",
                    task.task_id,
                    task.model_id,
                    busy.task_type,
                    busy.task_id
                );
                return NodeAck::rejected(
                    local,
                    format!(
                        "model {} is busy with {:?} task {} on this node",
                        task.model_id, busy.task_type, busy.task_id
                    ),
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    task_id: task.task_id.clone(),
                    task_type: task.task_type,
                });
            }
        }

        if task.coordinating_node != local {
            self.tasks.add_task(task.clone(), BTreeSet::new());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let result = match this.worker_pool.clone().acquire_owned().await {
                Ok(_permit) => job.await,
                Err(_) => Err(ClusterError::Runtime("worker pool closed".to_string())),
            };
            this.complete(task, kind, result).await;
        });

        NodeAck::accepted(local)
    }

    async fn load_locally(&self, input: &LoadModelInput) -> Result<()> {
        let path = self
            .retriever
            .retrieve_and_reassemble(&input.model_id, input.total_chunks)
            .await?;

        let loaded = async {
            verify_artifact(&input.model_id, &path, input.content_hash.as_deref()).await?;
            let meta = self.store.get_model_meta(&input.model_id).await?;
            self.runtime.load(&path, &input.model_id, &meta).await
        }
        .await;

        if loaded.is_err()
            && let Err(e) = self.retriever.evict(&input.model_id).await
        {
            tracing::warn!("Failed to evict model {}: {}", input.model_id, e);
        }
        loaded
    }

    /// Closes the local copy of the task and reports to the coordinator.
    async fn complete(&self, task: MlTask, kind: ForwardKind, result: Result<()>) {
        let local = self.local_node_id();
        let error = result.err().map(|e| e.to_string());
        match &error {
            None => tracing::info!("{:?} of model {} done on this node", kind, task.model_id),
            Some(e) => tracing::warn!("{:?} of model {} failed on this node: {}", kind, task.model_id, e),
        }

        if task.coordinating_node != local {
            let update = match &error {
                None => TaskUpdate::state(TaskState::Completed),
                Some(e) => TaskUpdate::failed(e.clone()),
            };
            if let Err(e) = self
                .tasks
                .update_task(&task.task_id, update, self.update_timeout, true)
                .await
            {
                tracing::debug!("Local copy of task {} not updated: {}", task.task_id, e);
            }
        }

        let forward = ForwardInput {
            kind,
            task_id: task.task_id.clone(),
            model_id: task.model_id.clone(),
            worker_node: local.clone(),
            error,
        };
        // free the model before reporting, so the coordinator's next job for it is accepted
        self.in_flight
            .remove_if(&task.model_id, |_, job| job.task_id == task.task_id);
        self.forward(forward, &task.coordinating_node).await;
    }

    async fn forward(&self, input: ForwardInput, coordinator: &NodeId) {
        if coordinator == &self.local_node_id() {
            if let Err(e) = self.on_forward(input).await {
                tracing::warn!("Local forward failed: {}", e);
            }
            return;
        }

        let Some(node) = self.membership.get_member(coordinator) else {
            tracing::warn!(
                "Coordinator {} of task {} is gone; dropping report",
                coordinator,
                input.task_id
            );
            return;
        };
        let task_id = input.task_id.clone();
        match self.transport.send(&node, ClusterMessage::Forward(input)).await {
            Ok(_) => tracing::debug!("Reported task {} to {}", task_id, coordinator),
            Err(e) => tracing::warn!("Failed to report task {} to {}: {}", task_id, coordinator, e),
        }
    }

    /// What this node holds and is working on right now.
    pub fn sync_state(&self) -> SyncState {
        let loaded_model_ids: BTreeSet<String> = self.runtime.list_loaded().into_iter().collect();
        let mut loading_model_ids = BTreeSet::new();
        let mut running_load_task_ids = BTreeSet::new();
        for entry in self.in_flight.iter() {
            if entry.task_type == TaskType::LoadModel {
                loading_model_ids.insert(entry.key().clone());
                running_load_task_ids.insert(entry.task_id.clone());
            }
        }

        SyncState {
            node_id: self.local_node_id(),
            model_status: format!(
                "{} loaded, {} loading",
                loaded_model_ids.len(),
                loading_model_ids.len()
            ),
            loaded_model_ids,
            loading_model_ids,
            running_load_task_ids,
        }
    }

    /// Entry point for every message a node receives from a peer.
    pub async fn handle_message(self: &Arc<Self>, message: ClusterMessage) -> Result<ClusterReply> {
        match message {
            ClusterMessage::LoadModel(input) => {
                Ok(ClusterReply::Ack(self.on_load_model_input(input)))
            }
            ClusterMessage::UnloadModel(input) => {
                Ok(ClusterReply::Ack(self.on_unload_model_input(input)))
            }
            ClusterMessage::Forward(input) => Ok(ClusterReply::Ack(self.on_forward(input).await?)),
            ClusterMessage::SyncUp => Ok(ClusterReply::SyncState(self.sync_state())),
            ClusterMessage::Profile(filter) => Ok(ClusterReply::Profile(self.local_profile(&filter))),
        }
    }

    pub fn local_profile(&self, filter: &ProfileFilter) -> NodeProfile {
        local_profile(
            &self.local_node_id(),
            &self.tasks,
            self.runtime.as_ref(),
            &self.routing,
            filter,
        )
    }
}
