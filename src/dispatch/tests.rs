//! Dispatch Tests
//!
//! Runs several nodes in one process over `LocalTransport`.
//!
//! ## Test Scopes
//! - **Load**: Placement, fan-out, reassembly on workers, routing and model state.
//! - **Failures**: Rejected, unreachable and failing workers.
//! - **Idempotence**: Duplicate forwards and duplicate job deliveries.
//! - **Model Exclusivity**: Overlapping jobs for one model on one worker.
//! - **Unload**: Route removal and model state.

use crate::chunk::types::{ModelMeta, ModelState};
use crate::config::ClusterConfig;
use crate::dispatch::protocol::{ForwardInput, ForwardKind, LoadModelInput};
use crate::error::ClusterError;
use crate::membership::types::{NodeId, NodeRole};
use crate::store::ArtifactStore;
use crate::store::memory::InMemoryArtifactStore;
use crate::task::types::{TaskState, TaskType};
use crate::testing::{
    FailingRuntime, FaultyStore, HangingRuntime, NodeSpec, TestCluster, wait_until,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.chunk.chunk_size_bytes = 10;
    config.task.update_timeout_ms = 1_000;
    config.dispatch.request_timeout_ms = 1_000;
    config
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn ids(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(|name| NodeId::from(*name)).collect()
}

/// Manager `n1` plus ML workers `n2` and `n3`.
fn three_nodes(n2: NodeSpec, n3: NodeSpec) -> TestCluster {
    TestCluster::start(
        config(),
        vec![NodeSpec::new("n1", &[NodeRole::ClusterManager]), n2, n3],
    )
}

fn ml(name: &str) -> NodeSpec {
    NodeSpec::new(name, &[NodeRole::Ml])
}

async fn wait_for_model_state(cluster: &TestCluster, model_id: &str, state: ModelState) -> ModelMeta {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let meta = cluster.memory.get_model_meta(model_id).await.unwrap();
        if meta.state == state {
            return meta;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "model {} stuck in {:?}",
            model_id,
            meta.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================
// LOAD
// ============================================================

#[tokio::test]
async fn test_load_on_two_ml_nodes() {
    // ARRANGE
    let cluster = three_nodes(ml("n2"), ml("n3"));
    let meta = cluster.register("m1", &payload(25)).await;
    assert_eq!(meta.total_chunks, 3);
    let coordinator = cluster.node("n1");

    // ACT
    let task_id = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;

    // ASSERT
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.task_type, TaskType::LoadModel);
    assert_eq!(task.worker_nodes, ids(&["n2", "n3"]));
    assert!(task.error.is_none());

    assert_eq!(coordinator.routing.workers("m1"), ids(&["n2", "n3"]));
    assert!(cluster.node("n2").runtime.is_loaded("m1"));
    assert!(cluster.node("n3").runtime.is_loaded("m1"));
    assert!(!cluster.node("n1").runtime.is_loaded("m1"));

    let meta = wait_for_model_state(&cluster, "m1", ModelState::Loaded).await;
    assert_eq!(meta.planning_worker_node_count, 2);
    assert_eq!(meta.current_worker_node_count, 2);

    // finished tasks leave the registry but stay readable from the store
    assert!(!coordinator.tasks.contains(&task_id));
    assert_eq!(
        coordinator.dispatcher.get_task(&task_id).await.unwrap().state,
        TaskState::Completed
    );
}

#[tokio::test]
async fn test_coordinator_can_be_its_own_worker() {
    let cluster = TestCluster::start(
        config(),
        vec![NodeSpec::new("solo", &[NodeRole::Data, NodeRole::Ml])],
    );
    cluster.register("m1", &payload(12)).await;

    let node = cluster.node("solo");
    let task_id = node.dispatcher.dispatch_load("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("solo", &task_id).await;

    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(node.routing.workers("m1"), ids(&["solo"]));
    assert!(node.runtime.is_loaded("m1"));
}

#[tokio::test]
async fn test_load_restricted_to_target_nodes() {
    let cluster = three_nodes(ml("n2"), ml("n3"));
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");

    let task_id = coordinator
        .dispatcher
        .dispatch_load("m1", Some(vec![NodeId::from("n3")]))
        .await
        .unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;

    assert_eq!(task.worker_nodes, ids(&["n3"]));
    assert_eq!(coordinator.routing.workers("m1"), ids(&["n3"]));
    assert!(!cluster.node("n2").runtime.is_loaded("m1"));
}

#[tokio::test]
async fn test_no_eligible_nodes_creates_no_task() {
    // ARRANGE: nobody can host a model
    let cluster = TestCluster::start(
        config(),
        vec![
            NodeSpec::new("n1", &[NodeRole::ClusterManager]),
            NodeSpec::new("n2", &[NodeRole::Ingest]),
        ],
    );
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");

    // ACT
    let result = coordinator.dispatcher.dispatch_load("m1", None).await;

    // ASSERT
    assert!(matches!(result, Err(ClusterError::NoEligibleNodes)));
    assert!(cluster.memory.task_records().is_empty());
    assert!(coordinator.tasks.snapshot().is_empty());
}

#[tokio::test]
async fn test_unknown_model_rejected() {
    let cluster = three_nodes(ml("n2"), ml("n3"));

    let result = cluster.node("n1").dispatcher.dispatch_load("missing", None).await;

    assert!(matches!(result, Err(ClusterError::ModelNotFound(_))));
    assert!(cluster.memory.task_records().is_empty());
}

#[tokio::test]
async fn test_running_load_limit() {
    let mut config = config();
    config.task.max_running_load_tasks = 1;
    let cluster = TestCluster::start(
        config,
        vec![
            NodeSpec::new("n1", &[NodeRole::ClusterManager]),
            ml("n2").with_runtime(Arc::new(HangingRuntime)),
        ],
    );
    cluster.register("m1", &payload(5)).await;
    cluster.register("m2", &payload(5)).await;
    let dispatcher = &cluster.node("n1").dispatcher;

    dispatcher.dispatch_load("m1", None).await.unwrap();
    let second = dispatcher.dispatch_load("m2", None).await;

    assert!(matches!(
        second,
        Err(ClusterError::TooManyRunningTasks { limit: 1, .. })
    ));
}

// ============================================================
// FAILURES
// ============================================================

#[tokio::test]
async fn test_partial_failure_completes_with_error() {
    let cluster = three_nodes(ml("n2").with_runtime(Arc::new(FailingRuntime)), ml("n3"));
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");

    let task_id = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;

    assert_eq!(task.state, TaskState::CompletedWithError);
    assert!(task.node_errors.contains_key(&NodeId::from("n2")));
    assert!(!task.node_errors.contains_key(&NodeId::from("n3")));
    assert!(task.error.as_deref().unwrap().contains("n2"));
    assert_eq!(coordinator.routing.workers("m1"), ids(&["n3"]));

    let meta = wait_for_model_state(&cluster, "m1", ModelState::PartiallyLoaded).await;
    assert_eq!(meta.current_worker_node_count, 1);
}

#[tokio::test]
async fn test_all_workers_failing_fails_the_task() {
    let cluster = three_nodes(
        ml("n2").with_runtime(Arc::new(FailingRuntime)),
        ml("n3").with_runtime(Arc::new(FailingRuntime)),
    );
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");

    let task_id = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.node_errors.len(), 2);
    assert!(coordinator.routing.workers("m1").is_empty());
    wait_for_model_state(&cluster, "m1", ModelState::LoadFailed).await;
}

#[tokio::test]
async fn test_unreachable_worker_counts_as_failed() {
    let cluster = three_nodes(ml("n2"), ml("n3"));
    cluster.register("m1", &payload(25)).await;
    cluster.transport.set_unreachable("n3");

    let task_id = cluster.node("n1").dispatcher.dispatch_load("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;

    assert_eq!(task.state, TaskState::CompletedWithError);
    let error = &task.node_errors[&NodeId::from("n3")];
    assert!(error.contains("failed to dispatch"), "{}", error);
    assert_eq!(cluster.node("n1").routing.workers("m1"), ids(&["n2"]));
}

// ============================================================
// IDEMPOTENCE
// ============================================================

#[tokio::test]
async fn test_duplicate_forward_is_ignored() {
    // ARRANGE: n3 never finishes, so the task waits on it
    let cluster = three_nodes(ml("n2"), ml("n3").with_runtime(Arc::new(HangingRuntime)));
    cluster.register("m1", &payload(25)).await;
    let dispatcher = cluster.node("n1").dispatcher.clone();
    let task_id = dispatcher.dispatch_load("m1", None).await.unwrap();

    let tasks = dispatcher.tasks().clone();
    let waiting_on_n3 = wait_until(WAIT, || {
        tasks.pending_worker_nodes(&task_id) == Some(ids(&["n3"]))
    })
    .await;
    assert!(waiting_on_n3);

    let done = |worker: &str| ForwardInput {
        kind: ForwardKind::LoadModelDone,
        task_id: task_id.clone(),
        model_id: "m1".to_string(),
        worker_node: NodeId::from(worker),
        error: None,
    };

    // ACT: n2 reports a second time
    let ack = dispatcher.on_forward(done("n2")).await.unwrap();

    // ASSERT
    assert_eq!(ack.message.as_deref(), Some("duplicate"));
    assert_eq!(tasks.get_task(&task_id).unwrap().state, TaskState::Running);

    // the last worker finishes the task exactly once
    dispatcher.on_forward(done("n3")).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &task_id).await;
    assert_eq!(task.state, TaskState::Completed);

    let ack = dispatcher.on_forward(done("n3")).await.unwrap();
    assert_eq!(ack.message.as_deref(), Some("task not active"));
    assert_eq!(
        dispatcher.get_task(&task_id).await.unwrap().state,
        TaskState::Completed
    );
}

#[tokio::test]
async fn test_duplicate_load_input_runs_once() {
    let cluster = three_nodes(ml("n2").with_runtime(Arc::new(HangingRuntime)), ml("n3"));
    let meta = cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");
    let task_id = coordinator
        .dispatcher
        .dispatch_load("m1", Some(vec![NodeId::from("n2")]))
        .await
        .unwrap();

    let worker = cluster.node("n2").dispatcher.clone();
    let started = wait_until(WAIT, || {
        worker.sync_state().running_load_task_ids.contains(&task_id)
    })
    .await;
    assert!(started);

    let task = coordinator.tasks.get_task(&task_id).unwrap();
    let input = LoadModelInput {
        model_id: "m1".to_string(),
        task_id: task_id.clone(),
        worker_node_count: 1,
        coordinating_node: NodeId::from("n1"),
        task,
        total_chunks: meta.total_chunks,
        content_hash: meta.content_hash.clone(),
    };
    let ack = worker.on_load_model_input(input);

    assert!(ack.accepted);
    assert_eq!(ack.message.as_deref(), Some("already in progress"));

    let state = worker.sync_state();
    assert_eq!(state.running_load_task_ids.len(), 1);
    assert!(state.loading_model_ids.contains("m1"));
    assert!(state.loaded_model_ids.is_empty());
}

// ============================================================
// MODEL EXCLUSIVITY
// ============================================================

/// Managers `n1` and `n4` share worker `n2`, which reads chunks slowly.
fn slow_worker_cluster() -> TestCluster {
    let memory = Arc::new(InMemoryArtifactStore::new());
    let store = Arc::new(FaultyStore::new(memory.clone()).with_chunk_delay(Duration::from_millis(50)));
    TestCluster::start_with_store(
        config(),
        memory,
        store,
        vec![
            NodeSpec::new("n1", &[NodeRole::ClusterManager]),
            ml("n2"),
            NodeSpec::new("n4", &[NodeRole::ClusterManager]),
        ],
    )
}

async fn wait_until_loading(cluster: &TestCluster, worker: &str, task_id: &crate::task::types::TaskId) {
    let worker = cluster.node(worker).dispatcher.clone();
    let started = wait_until(WAIT, || worker.sync_state().running_load_task_ids.contains(task_id)).await;
    assert!(started);
}

#[tokio::test]
async fn test_second_load_while_loading_is_rejected() {
    // ARRANGE: 5 chunks at 50ms each
    let cluster = slow_worker_cluster();
    cluster.register("m1", &payload(50)).await;
    let coordinator = cluster.node("n1");
    let first = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(70)).await;

    // ACT
    let second = coordinator.dispatcher.dispatch_load("m1", None).await;

    // ASSERT
    assert!(matches!(second, Err(ClusterError::ModelBusy { .. })));
    let task = cluster.wait_for_terminal("n1", &first).await;
    assert_eq!(task.state, TaskState::Completed, "{:?}", task.error);
    assert!(cluster.node("n2").runtime.is_loaded("m1"));

    // the model can be loaded again once the first task is done
    let again = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    assert_eq!(
        cluster.wait_for_terminal("n1", &again).await.state,
        TaskState::Completed
    );
}

#[tokio::test]
async fn test_worker_rejects_overlapping_load_from_other_coordinator() {
    // ARRANGE
    let cluster = slow_worker_cluster();
    cluster.register("m1", &payload(50)).await;
    let first = cluster.node("n1").dispatcher.dispatch_load("m1", None).await.unwrap();
    wait_until_loading(&cluster, "n2", &first).await;

    // ACT: n4 knows nothing about n1's task
    let second = cluster.node("n4").dispatcher.dispatch_load("m1", None).await.unwrap();
    let rejected = cluster.wait_for_terminal("n4", &second).await;

    // ASSERT
    assert_eq!(rejected.state, TaskState::Failed);
    assert!(rejected.node_errors[&NodeId::from("n2")].contains("busy"));

    let loaded = cluster.wait_for_terminal("n1", &first).await;
    assert_eq!(loaded.state, TaskState::Completed, "{:?}", loaded.error);
    assert!(cluster.node("n2").runtime.is_loaded("m1"));
    assert_eq!(cluster.node("n1").routing.workers("m1"), ids(&["n2"]));
}

#[tokio::test]
async fn test_unload_during_load_is_rejected() {
    // ARRANGE
    let cluster = slow_worker_cluster();
    cluster.register("m1", &payload(50)).await;
    let load = cluster.node("n1").dispatcher.dispatch_load("m1", None).await.unwrap();
    wait_until_loading(&cluster, "n2", &load).await;

    // ACT
    let unload = cluster
        .node("n4")
        .dispatcher
        .dispatch_unload("m1", Some(vec![NodeId::from("n2")]))
        .await
        .unwrap();
    let unload = cluster.wait_for_terminal("n4", &unload).await;

    // ASSERT: the load keeps its cache directory and finishes
    assert_eq!(unload.state, TaskState::Failed);
    let load = cluster.wait_for_terminal("n1", &load).await;
    assert_eq!(load.state, TaskState::Completed, "{:?}", load.error);
    assert!(cluster.node("n2").runtime.is_loaded("m1"));
}

// ============================================================
// UNLOAD
// ============================================================

#[tokio::test]
async fn test_unload_removes_routes() {
    // ARRANGE
    let cluster = three_nodes(ml("n2"), ml("n3"));
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");
    let load = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    cluster.wait_for_terminal("n1", &load).await;

    // ACT
    let unload = coordinator.dispatcher.dispatch_unload("m1", None).await.unwrap();
    let task = cluster.wait_for_terminal("n1", &unload).await;

    // ASSERT
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.task_type, TaskType::UnloadModel);
    assert_eq!(task.worker_nodes, ids(&["n2", "n3"]));
    assert!(coordinator.routing.workers("m1").is_empty());
    assert!(!cluster.node("n2").runtime.is_loaded("m1"));
    assert!(!cluster.node("n3").runtime.is_loaded("m1"));

    let meta = wait_for_model_state(&cluster, "m1", ModelState::Unloaded).await;
    assert_eq!(meta.current_worker_node_count, 0);
}

#[tokio::test]
async fn test_partial_unload_keeps_remaining_route() {
    let cluster = three_nodes(ml("n2"), ml("n3"));
    cluster.register("m1", &payload(25)).await;
    let coordinator = cluster.node("n1");
    let load = coordinator.dispatcher.dispatch_load("m1", None).await.unwrap();
    cluster.wait_for_terminal("n1", &load).await;

    let unload = coordinator
        .dispatcher
        .dispatch_unload("m1", Some(vec![NodeId::from("n2")]))
        .await
        .unwrap();
    cluster.wait_for_terminal("n1", &unload).await;

    assert_eq!(coordinator.routing.workers("m1"), ids(&["n3"]));
    assert!(cluster.node("n3").runtime.is_loaded("m1"));
    wait_for_model_state(&cluster, "m1", ModelState::PartiallyLoaded).await;
}

#[tokio::test]
async fn test_unload_unknown_model_rejected() {
    let cluster = three_nodes(ml("n2"), ml("n3"));

    let result = cluster.node("n1").dispatcher.dispatch_unload("missing", None).await;

    assert!(matches!(result, Err(ClusterError::ModelNotFound(_))));
}
