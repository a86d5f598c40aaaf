//! In-process cluster harness used by the unit tests.
//!
//! Nodes share one in-memory store and talk through [`LocalTransport`], which
//! calls the target node's dispatcher directly. Faults are injected by marking
//! nodes unreachable, failing chunk reads, or giving a node a runtime that
//! never finishes loading.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::chunk::types::{ModelChunk, ModelMeta, ModelStateUpdate};
use crate::config::ClusterConfig;
use crate::dispatch::service::{ModelDispatcher, NodeComponents};
use crate::error::{ClusterError, Result};
use crate::membership::provider::MembershipProvider;
use crate::membership::types::{Node, NodeId, NodeRole, NodeState};
use crate::node::ClusterNode;
use crate::runtime::file::FileModelRuntime;
use crate::runtime::{ModelRuntime, SharedRuntime};
use crate::store::memory::InMemoryArtifactStore;
use crate::store::{ArtifactStore, SharedStore};
use crate::task::types::{MlTask, TaskId, TaskUpdate};
use crate::transport::{ClusterMessage, ClusterReply, Transport};

/// Store wrapper that can fail, mislabel or slow down chunk reads.
pub struct FaultyStore {
    pub inner: Arc<InMemoryArtifactStore>,
    pub failing_chunk: Option<u32>,
    /// Served with the index of the following chunk.
    pub misindexed_chunk: Option<u32>,
    pub chunk_delay: Duration,
    chunk_fetches: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryArtifactStore>) -> Self {
        Self {
            inner,
            failing_chunk: None,
            misindexed_chunk: None,
            chunk_delay: Duration::ZERO,
            chunk_fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(mut self, index: u32) -> Self {
        self.failing_chunk = Some(index);
        self
    }

    pub fn misindexed_at(mut self, index: u32) -> Self {
        self.misindexed_chunk = Some(index);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn chunk_fetches(&self) -> usize {
        self.chunk_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for FaultyStore {
    async fn get_model_meta(&self, model_id: &str) -> Result<ModelMeta> {
        self.inner.get_model_meta(model_id).await
    }

    async fn get_chunk(&self, model_id: &str, index: u32) -> Result<ModelChunk> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        if self.failing_chunk == Some(index) {
            return Err(ClusterError::Store(format!("injected failure reading chunk {}", index)));
        }
        let mut chunk = self.inner.get_chunk(model_id, index).await?;
        if self.misindexed_chunk == Some(index) {
            chunk.index = index + 1;
        }
        Ok(chunk)
    }

    async fn put_model_meta(&self, meta: &ModelMeta) -> Result<()> {
        self.inner.put_model_meta(meta).await
    }

    async fn put_chunk(&self, chunk: &ModelChunk) -> Result<()> {
        self.inner.put_chunk(chunk).await
    }

    async fn update_model_state(&self, model_id: &str, update: &ModelStateUpdate) -> Result<()> {
        self.inner.update_model_state(model_id, update).await
    }

    async fn list_models(&self) -> Result<Vec<ModelMeta>> {
        self.inner.list_models().await
    }

    async fn put_task_record(&self, task: &MlTask) -> Result<TaskId> {
        self.inner.put_task_record(task).await
    }

    async fn update_task_record(&self, task_id: &TaskId, update: &TaskUpdate) -> Result<()> {
        self.inner.update_task_record(task_id, update).await
    }

    async fn get_task_record(&self, task_id: &TaskId) -> Result<Option<MlTask>> {
        self.inner.get_task_record(task_id).await
    }
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================
// Membership
// ============================================================

pub fn test_node(name: &str, roles: &[NodeRole]) -> Node {
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    Node {
        id: NodeId::from(name),
        name: name.to_string(),
        roles: roles.iter().copied().collect(),
        group: None,
        gossip_addr: addr,
        http_addr: addr,
        state: NodeState::Alive,
        incarnation: 1,
        last_seen: None,
    }
}

/// Membership view over a node list shared by the whole test cluster.
pub struct StaticMembership {
    local: NodeId,
    nodes: Arc<RwLock<Vec<Node>>>,
}

impl StaticMembership {
    pub fn new(local: NodeId, nodes: Arc<RwLock<Vec<Node>>>) -> Self {
        Self { local, nodes }
    }
}

impl MembershipProvider for StaticMembership {
    fn local_node(&self) -> Node {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .find(|node| node.id == self.local)
            .cloned()
            .unwrap()
    }

    fn current_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .filter(|node| node.is_alive())
            .cloned()
            .collect()
    }
}

// ============================================================
// Transport
// ============================================================

/// Delivers messages by calling the target's dispatcher in-process.
#[derive(Default)]
pub struct LocalTransport {
    dispatchers: DashMap<NodeId, Arc<ModelDispatcher>>,
    unreachable: DashSet<NodeId>,
    delay_ms: AtomicU64,
}

impl LocalTransport {
    pub fn register(&self, dispatcher: Arc<ModelDispatcher>) {
        self.dispatchers.insert(dispatcher.local_node_id(), dispatcher);
    }

    pub fn set_unreachable(&self, node: &str) {
        self.unreachable.insert(NodeId::from(node));
    }

    pub fn set_reachable(&self, node: &str) {
        self.unreachable.remove(&NodeId::from(node));
    }

    /// Delays every delivery by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, target: &Node, message: ClusterMessage) -> Result<ClusterReply> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unreachable.contains(&target.id) {
            return Err(ClusterError::Messaging(format!("{} is unreachable", target.id)));
        }
        let dispatcher = self
            .dispatchers
            .get(&target.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::Messaging(format!("no such node {}", target.id)))?;
        dispatcher.handle_message(message).await
    }
}

// ============================================================
// Runtimes
// ============================================================

/// Runtime whose loads never finish.
pub struct HangingRuntime;

#[async_trait]
impl ModelRuntime for HangingRuntime {
    async fn load(&self, _artifact: &Path, _model_id: &str, _meta: &ModelMeta) -> Result<()> {
        std::future::pending().await
    }

    async fn unload(&self, _model_id: &str) -> Result<()> {
        Ok(())
    }

    fn is_loaded(&self, _model_id: &str) -> bool {
        false
    }

    fn list_loaded(&self) -> Vec<String> {
        Vec::new()
    }
}

/// File runtime that never finishes loading one particular model.
pub struct StallingRuntime {
    inner: FileModelRuntime,
    stalled_model: String,
    _dir: tempfile::TempDir,
}

impl StallingRuntime {
    pub fn new(stalled_model: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            inner: FileModelRuntime::new(dir.path().join("resident")),
            stalled_model: stalled_model.to_string(),
            _dir: dir,
        }
    }
}

#[async_trait]
impl ModelRuntime for StallingRuntime {
    async fn load(&self, artifact: &Path, model_id: &str, meta: &ModelMeta) -> Result<()> {
        if model_id == self.stalled_model {
            return std::future::pending().await;
        }
        self.inner.load(artifact, model_id, meta).await
    }

    async fn unload(&self, model_id: &str) -> Result<()> {
        self.inner.unload(model_id).await
    }

    fn is_loaded(&self, model_id: &str) -> bool {
        self.inner.is_loaded(model_id)
    }

    fn list_loaded(&self) -> Vec<String> {
        self.inner.list_loaded()
    }
}

/// Runtime that rejects every load.
pub struct FailingRuntime;

#[async_trait]
impl ModelRuntime for FailingRuntime {
    async fn load(&self, _artifact: &Path, model_id: &str, _meta: &ModelMeta) -> Result<()> {
        Err(ClusterError::Runtime(format!("cannot load {}", model_id)))
    }

    async fn unload(&self, _model_id: &str) -> Result<()> {
        Ok(())
    }

    fn is_loaded(&self, _model_id: &str) -> bool {
        false
    }

    fn list_loaded(&self) -> Vec<String> {
        Vec::new()
    }
}

// ============================================================
// Cluster
// ============================================================

pub struct NodeSpec {
    pub name: String,
    pub roles: Vec<NodeRole>,
    pub runtime: Option<SharedRuntime>,
}

impl NodeSpec {
    pub fn new(name: &str, roles: &[NodeRole]) -> Self {
        Self {
            name: name.to_string(),
            roles: roles.to_vec(),
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: SharedRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

/// Several nodes in one process sharing a store and a [`LocalTransport`].
pub struct TestCluster {
    pub memory: Arc<InMemoryArtifactStore>,
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<Arc<ClusterNode>>,
    members: Arc<RwLock<Vec<Node>>>,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    pub fn start(config: ClusterConfig, specs: Vec<NodeSpec>) -> Self {
        let memory = Arc::new(InMemoryArtifactStore::new());
        Self::start_with_store(config, memory.clone(), memory, specs)
    }

    pub fn start_with_store(
        config: ClusterConfig,
        memory: Arc<InMemoryArtifactStore>,
        store: SharedStore,
        specs: Vec<NodeSpec>,
    ) -> Self {
        let members = Arc::new(RwLock::new(
            specs
                .iter()
                .map(|spec| test_node(&spec.name, &spec.roles))
                .collect::<Vec<_>>(),
        ));
        let transport = Arc::new(LocalTransport::default());

        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for spec in specs {
            let dir = tempfile::tempdir().unwrap();
            let mut node_config = config.clone();
            node_config.chunk.cache_dir = dir.path().join("cache");

            let runtime = spec.runtime.unwrap_or_else(|| {
                Arc::new(FileModelRuntime::new(dir.path().join("resident")))
            });
            let membership = Arc::new(StaticMembership::new(
                NodeId::from(spec.name.as_str()),
                members.clone(),
            ));
            let node = ClusterNode::new(
                node_config,
                NodeComponents {
                    membership,
                    transport: transport.clone(),
                    store: store.clone(),
                    runtime,
                },
            );
            transport.register(node.dispatcher.clone());
            nodes.push(node);
            dirs.push(dir);
        }

        Self {
            memory,
            transport,
            nodes,
            members,
            _dirs: dirs,
        }
    }

    pub fn node(&self, name: &str) -> &Arc<ClusterNode> {
        let id = NodeId::from(name);
        self.nodes
            .iter()
            .find(|node| node.dispatcher.local_node_id() == id)
            .unwrap()
    }

    /// Marks the node dead in every view and stops delivering to it.
    pub fn kill(&self, name: &str) {
        for node in self.members.write().unwrap().iter_mut() {
            if node.name == name {
                node.state = NodeState::Dead;
            }
        }
        self.transport.set_unreachable(name);
    }

    pub async fn register(&self, model_id: &str, payload: &[u8]) -> ModelMeta {
        self.nodes[0]
            .register_model(model_id, model_id, payload)
            .await
            .unwrap()
    }

    /// Polls the task on `coordinator` until it reaches a terminal state.
    pub async fn wait_for_terminal(&self, coordinator: &str, task_id: &TaskId) -> MlTask {
        let dispatcher = &self.node(coordinator).dispatcher;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let task = dispatcher.get_task(task_id).await.unwrap();
            if task.state.is_terminal() {
                return task;
            }
            assert!(Instant::now() < deadline, "task {} stuck in {:?}", task_id, task.state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
