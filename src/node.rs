//! One cluster node: every component wired together.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::chunk::splitter::register_model;
use crate::chunk::types::ModelMeta;
use crate::config::ClusterConfig;
use crate::dispatch::service::{ModelDispatcher, NodeComponents};
use crate::error::Result;
use crate::membership::provider::MembershipProvider;
use crate::membership::types::MembershipEvent;
use crate::profile::aggregator::ProfileAggregator;
use crate::routing::RoutingTable;
use crate::runtime::SharedRuntime;
use crate::store::SharedStore;
use crate::sync::reconciler::SyncReconciler;
use crate::task::registry::TaskRegistry;

pub struct ClusterNode {
    pub config: ClusterConfig,
    pub membership: Arc<dyn MembershipProvider>,
    pub store: SharedStore,
    pub runtime: SharedRuntime,
    pub tasks: Arc<TaskRegistry>,
    pub routing: Arc<RoutingTable>,
    pub dispatcher: Arc<ModelDispatcher>,
    pub reconciler: Arc<SyncReconciler>,
    pub profiler: ProfileAggregator,
}

impl ClusterNode {
    pub fn new(config: ClusterConfig, components: NodeComponents) -> Arc<Self> {
        let local = components.membership.local_node_id();
        let tasks = Arc::new(TaskRegistry::new(
            local,
            components.store.clone(),
            config.task.update_timeout(),
        ));
        let routing = Arc::new(RoutingTable::new());

        let dispatcher =
            ModelDispatcher::new(&config, components.clone(), tasks.clone(), routing.clone());
        let reconciler = Arc::new(SyncReconciler::new(
            config.sync.clone(),
            components.membership.clone(),
            components.transport.clone(),
            components.store.clone(),
            tasks.clone(),
            routing.clone(),
        ));
        let profiler = ProfileAggregator::new(
            components.membership.clone(),
            components.transport.clone(),
            config.dispatch.request_timeout(),
        );

        Arc::new(Self {
            config,
            membership: components.membership,
            store: components.store,
            runtime: components.runtime,
            tasks,
            routing,
            dispatcher,
            reconciler,
            profiler,
        })
    }

    /// Splits `payload` and uploads it with the configured chunk size.
    pub async fn register_model(&self, model_id: &str, name: &str, payload: &[u8]) -> Result<ModelMeta> {
        let meta = register_model(
            self.store.as_ref(),
            model_id,
            name,
            payload,
            self.config.chunk.chunk_size_bytes,
        )
        .await?;
        tracing::info!(
            "Registered model {} ({} bytes in {} chunk(s))",
            meta.model_id,
            meta.size_bytes,
            meta.total_chunks
        );
        Ok(meta)
    }

    /// Starts the reconciliation loop.
    pub fn spawn_background(
        &self,
        events: Option<broadcast::Receiver<MembershipEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        self.reconciler.clone().spawn(events)
    }

    /// Logs membership and task counts every `period`.
    pub fn spawn_stats(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let alive = node.membership.current_nodes();
                let counts = node.tasks.status_counts();
                tracing::info!(
                    "Cluster stats: {} alive nodes, {} routed models, {} running tasks",
                    alive.len(),
                    node.routing.snapshot().len(),
                    counts.running
                );
                for member in alive {
                    tracing::info!(
                        "  - {} ({}) http={} roles={:?}",
                        member.name,
                        member.id,
                        member.http_addr,
                        member.roles
                    );
                }
            }
        })
    }
}
