use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};

use super::types::{RoutePair, SyncMode, SyncReport, SyncState};
use crate::chunk::types::{ModelMeta, ModelState, ModelStateUpdate};
use crate::config::{OrphanedTaskPolicy, SyncConfig};
use crate::error::{ClusterError, Result};
use crate::membership::provider::MembershipProvider;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::routing::RoutingTable;
use crate::store::SharedStore;
use crate::task::registry::TaskRegistry;
use crate::task::types::{MlTask, TaskId, TaskType, TaskUpdate, now_ms};
use crate::transport::{ClusterMessage, ClusterReply, SharedTransport, fan_out};

pub const ORPHANED_TASK_ERROR: &str = "orphaned: no node reports this task as running";

/// Audits what nodes actually hold against the routing table and the task
/// registry, and repairs the difference.
pub struct SyncReconciler {
    config: SyncConfig,
    membership: Arc<dyn MembershipProvider>,
    transport: SharedTransport,
    store: SharedStore,
    tasks: Arc<TaskRegistry>,
    routing: Arc<RoutingTable>,
    running: Semaphore,
}

impl SyncReconciler {
    pub fn new(
        config: SyncConfig,
        membership: Arc<dyn MembershipProvider>,
        transport: SharedTransport,
        store: SharedStore,
        tasks: Arc<TaskRegistry>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        Self {
            config,
            membership,
            transport,
            store,
            tasks,
            routing,
            running: Semaphore::new(1),
        }
    }

    /// One full reconciliation pass.
    ///
    /// Fails with `SyncInProgress` instead of waiting when another pass holds
    /// the slot.
    pub async fn run_pass(&self, mode: SyncMode) -> Result<SyncReport> {
        let _slot = self
            .running
            .try_acquire()
            .map_err(|_| ClusterError::SyncInProgress)?;

        let nodes = self.membership.current_nodes();
        let routed_before = self.routing.pairs();
        let gathered = fan_out(
            self.transport.as_ref(),
            &nodes,
            ClusterMessage::SyncUp,
            self.config.request_timeout(),
            ClusterReply::into_sync_state,
        )
        .await;

        let mut report = SyncReport {
            mode,
            unreachable: gathered.failures,
            ..Default::default()
        };
        // unreachable nodes count as holding nothing
        let states: Vec<SyncState> = gathered.successes.into_values().collect();

        self.reconcile_routing(mode, &states, &routed_before, &mut report);
        self.reconcile_tasks(&states, &mut report).await;
        self.refresh_model_states(&states, &mut report).await;

        if report.is_clean() {
            tracing::debug!("Sync pass ({:?}) found no drift", mode);
        } else {
            tracing::info!(
                "Sync pass ({:?}): -{} +{} routes, {} orphaned task(s), {} unreachable node(s)",
                mode,
                report.removed.len(),
                report.added.len(),
                report.orphaned_tasks.len(),
                report.unreachable.len()
            );
        }
        Ok(report)
    }

    fn reconcile_routing(
        &self,
        mode: SyncMode,
        states: &[SyncState],
        routed_before: &BTreeSet<(String, NodeId)>,
        report: &mut SyncReport,
    ) {
        // Routes added by forwards while the fan-out was in flight are newer
        // than the reports and survive this pass.
        let fresh: BTreeSet<(String, NodeId)> = self
            .routing
            .pairs()
            .difference(routed_before)
            .cloned()
            .collect();
        if mode == SyncMode::Clear {
            self.routing.clear();
            for (model_id, node_id) in &fresh {
                self.routing.add(model_id, node_id);
            }
        }

        let reported: BTreeSet<(String, NodeId)> = states
            .iter()
            .flat_map(|state| {
                state
                    .loaded_model_ids
                    .iter()
                    .map(|model_id| (model_id.clone(), state.node_id.clone()))
            })
            .collect();

        for (model_id, node_id) in self.routing.pairs() {
            let pair = (model_id.clone(), node_id.clone());
            if !reported.contains(&pair) && !fresh.contains(&pair) {
                tracing::warn!("Model {} is no longer loaded on {}; removing route", model_id, node_id);
                self.routing.remove(&model_id, &node_id);
                report.removed.push(RoutePair { model_id, node_id });
            }
        }

        for (model_id, node_id) in reported {
            if self.routing.add(&model_id, &node_id) {
                if mode == SyncMode::Refresh {
                    let anomaly = format!("model {} loaded on {} but not routed", model_id, node_id);
                    tracing::warn!("{}", anomaly);
                    report.anomalies.push(anomaly);
                }
                report.added.push(RoutePair { model_id, node_id });
            }
        }
    }

    async fn reconcile_tasks(&self, states: &[SyncState], report: &mut SyncReport) {
        let reported_running: BTreeSet<TaskId> = states
            .iter()
            .flat_map(|state| state.running_load_task_ids.iter().cloned())
            .collect();

        let local = self.membership.local_node_id();
        let now = now_ms();
        let orphans: Vec<MlTask> = self
            .tasks
            .running_tasks()
            .into_iter()
            .filter(|task| task.task_type == TaskType::LoadModel && task.coordinating_node == local)
            .filter(|task| !reported_running.contains(&task.task_id))
            .filter(|task| now.saturating_sub(task.last_update_time) >= self.config.orphan_grace_ms)
            .collect();

        for task in orphans {
            match self.config.orphaned_task_policy {
                OrphanedTaskPolicy::Fail => {
                    tracing::warn!("Failing orphaned task {} for model {}", task.task_id, task.model_id);
                    let result = self
                        .tasks
                        .update_task(
                            &task.task_id,
                            TaskUpdate::failed(ORPHANED_TASK_ERROR),
                            self.tasks.update_timeout(),
                            true,
                        )
                        .await;
                    if let Err(e) = result {
                        tracing::error!("Could not fail orphaned task {}: {}", task.task_id, e);
                        continue;
                    }
                }
                OrphanedTaskPolicy::Keep => {
                    tracing::warn!(
                        "Task {} for model {} is running but no node works on it",
                        task.task_id,
                        task.model_id
                    );
                }
            }
            report.orphaned_tasks.push(task.task_id);
        }

        for task_id in reported_running {
            if self.tasks.contains(&task_id) {
                continue;
            }
            let untracked = match self.store.get_task_record(&task_id).await {
                Ok(Some(record)) => record.state.is_terminal(),
                Ok(None) => true,
                Err(e) => {
                    tracing::debug!("Could not look up task {}: {}", task_id, e);
                    false
                }
            };
            if untracked {
                let anomaly = format!("task {} reported running but is not tracked", task_id);
                tracing::warn!("{}", anomaly);
                report.anomalies.push(anomaly);
            }
        }
    }

    async fn refresh_model_states(&self, states: &[SyncState], report: &mut SyncReport) {
        let models = match self.store.list_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!("Skipping model state refresh: {}", e);
                return;
            }
        };

        let mut loading: BTreeSet<String> = states
            .iter()
            .flat_map(|state| state.loading_model_ids.iter().cloned())
            .collect();
        loading.extend(
            self.tasks
                .running_tasks_of_type(TaskType::LoadModel)
                .into_iter()
                .map(|task| task.model_id),
        );
        let routed: BTreeMap<String, BTreeSet<NodeId>> = self.routing.snapshot();

        for meta in models {
            let current = routed.get(&meta.model_id).map_or(0, |nodes| nodes.len()) as u32;
            let Some(next) = next_model_state(&meta, current, loading.contains(&meta.model_id))
            else {
                continue;
            };

            let update = ModelStateUpdate::new(next).current(current);
            match self.store.update_model_state(&meta.model_id, &update).await {
                Ok(()) => {
                    tracing::info!("Model {} is now {:?}", meta.model_id, next);
                    report.models_updated.push(meta.model_id);
                }
                Err(e) => tracing::warn!("Failed to update model {}: {}", meta.model_id, e),
            }
        }
    }

    /// Runs a pass every `interval_secs` and after every membership change.
    pub fn spawn(
        self: Arc<Self>,
        mut events: Option<broadcast::Receiver<MembershipEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            loop {
                let mode = tokio::select! {
                    _ = interval.tick() => SyncMode::Refresh,
                    Some(event) = next_event(&mut events) => {
                        tracing::info!("Membership changed ({:?}); reconciling", event);
                        if self.config.clear_on_membership_change {
                            SyncMode::Clear
                        } else {
                            SyncMode::Refresh
                        }
                    }
                };

                match self.run_pass(mode).await {
                    Ok(_) => {}
                    Err(ClusterError::SyncInProgress) => {
                        tracing::debug!("Sync pass skipped: another pass is running")
                    }
                    Err(e) => tracing::error!("Sync pass failed: {}", e),
                }
            }
        })
    }
}

/// State a model should move to, or `None` when it is already right.
fn next_model_state(meta: &ModelMeta, current: u32, load_running: bool) -> Option<ModelState> {
    let next = if current == 0 {
        if load_running {
            ModelState::Loading
        } else if matches!(meta.state, ModelState::Loaded | ModelState::PartiallyLoaded) {
            ModelState::LoadFailed
        } else {
            return None;
        }
    } else if current < meta.planning_worker_node_count {
        ModelState::PartiallyLoaded
    } else {
        ModelState::Loaded
    };

    (next != meta.state || current != meta.current_worker_node_count).then_some(next)
}

/// Next membership event; never resolves when there is no channel.
async fn next_event(
    events: &mut Option<broadcast::Receiver<MembershipEvent>>,
) -> Option<MembershipEvent> {
    let Some(receiver) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Missed {} membership event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                *events = None;
                return std::future::pending().await;
            }
        }
    }
}
