//! Artifact Store Tests
//!
//! ## Test Scopes
//! - **In-Memory**: Model, chunk and task record behaviour.
//! - **HTTP**: The remote client against the hosted `/store` routes.

#[cfg(test)]
mod tests {
    use crate::chunk::splitter::register_model;
    use crate::chunk::types::{ModelState, ModelStateUpdate};
    use crate::error::ClusterError;
    use crate::membership::types::NodeId;
    use crate::server::store_router;
    use crate::store::memory::InMemoryArtifactStore;
    use crate::store::remote::HttpArtifactStore;
    use crate::store::{ArtifactStore, SharedStore};
    use crate::task::types::{MlTask, TaskId, TaskState, TaskType, TaskUpdate};
    use std::sync::Arc;
    use std::time::Duration;

    async fn serve_store(store: SharedStore) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, store_router(store)).await.unwrap();
        });
        addr
    }

    // ============================================================
    // IN-MEMORY
    // ============================================================

    #[tokio::test]
    async fn test_model_state_update() {
        let store = InMemoryArtifactStore::new();
        register_model(&store, "m1", "model one", &[1u8; 30], 10)
            .await
            .unwrap();

        let update = ModelStateUpdate::new(ModelState::Loading).planning(3);
        store.update_model_state("m1", &update).await.unwrap();

        let meta = store.get_model_meta("m1").await.unwrap();
        assert_eq!(meta.state, ModelState::Loading);
        assert_eq!(meta.planning_worker_node_count, 3);
        assert_eq!(meta.current_worker_node_count, 0);
        assert_eq!(store.chunk_count("m1"), 3);
    }

    #[tokio::test]
    async fn test_unknown_model_and_chunk() {
        let store = InMemoryArtifactStore::new();

        assert!(matches!(
            store.get_model_meta("nope").await,
            Err(ClusterError::ModelNotFound(_))
        ));
        assert!(matches!(
            store.get_chunk("nope", 0).await,
            Err(ClusterError::Store(_))
        ));
        assert!(store.list_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunks_are_immutable() {
        let store = InMemoryArtifactStore::new();
        register_model(&store, "m1", "m1", &[1u8; 5], 10).await.unwrap();

        let chunk = store.get_chunk("m1", 0).await.unwrap();
        assert!(store.put_chunk(&chunk).await.is_err());
    }

    #[tokio::test]
    async fn test_task_record_lifecycle() {
        let store = InMemoryArtifactStore::new();
        let task = MlTask::new("m1", TaskType::LoadModel, NodeId::from("n1"));

        let task_id = store.put_task_record(&task).await.unwrap();
        store
            .update_task_record(&task_id, &TaskUpdate::state(TaskState::Running))
            .await
            .unwrap();
        store
            .update_task_record(&task_id, &TaskUpdate::state(TaskState::Completed))
            .await
            .unwrap();

        // terminal records reject further changes
        let late = store
            .update_task_record(&task_id, &TaskUpdate::failed("late"))
            .await;
        assert!(matches!(late, Err(ClusterError::TaskTerminal(_))));

        let record = store.get_task_record(&task_id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert!(store
            .get_task_record(&TaskId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    // ============================================================
    // HTTP
    // ============================================================

    #[tokio::test]
    async fn test_remote_store_round_trip() {
        // ARRANGE
        let hosted = Arc::new(InMemoryArtifactStore::new());
        let addr = serve_store(hosted.clone()).await;
        let remote = HttpArtifactStore::new(addr, Duration::from_secs(5));

        // ACT: upload through the client
        let payload: Vec<u8> = (0..=255u8).collect();
        let meta = register_model(&remote, "m1", "bytes", &payload, 100)
            .await
            .unwrap();

        // ASSERT
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(hosted.chunk_count("m1"), 3);
        assert_eq!(remote.get_model_meta("m1").await.unwrap(), meta);
        assert_eq!(remote.list_models().await.unwrap(), vec![meta.clone()]);

        let chunk = remote.get_chunk("m1", 2).await.unwrap();
        assert_eq!(chunk.content, payload[200..].to_vec());

        remote
            .update_model_state("m1", &ModelStateUpdate::new(ModelState::Loaded).current(2))
            .await
            .unwrap();
        assert_eq!(
            hosted.get_model_meta("m1").await.unwrap().current_worker_node_count,
            2
        );
    }

    #[tokio::test]
    async fn test_remote_store_not_found() {
        let addr = serve_store(Arc::new(InMemoryArtifactStore::new())).await;
        let remote = HttpArtifactStore::new(addr, Duration::from_secs(5));

        assert!(matches!(
            remote.get_model_meta("nope").await,
            Err(ClusterError::ModelNotFound(_))
        ));
        assert!(remote.get_chunk("nope", 0).await.is_err());
        assert!(remote
            .get_task_record(&TaskId::from("nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remote_task_records() {
        let hosted = Arc::new(InMemoryArtifactStore::new());
        let addr = serve_store(hosted.clone()).await;
        let remote = HttpArtifactStore::new(addr, Duration::from_secs(5));
        let task = MlTask::new("m1", TaskType::UnloadModel, NodeId::from("n1"));

        let task_id = remote.put_task_record(&task).await.unwrap();
        remote
            .update_task_record(&task_id, &TaskUpdate::failed("no workers"))
            .await
            .unwrap();

        let record = remote.get_task_record(&task_id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error.as_deref(), Some("no workers"));
        assert_eq!(hosted.task_records().len(), 1);
    }
}
