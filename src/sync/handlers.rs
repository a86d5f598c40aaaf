use axum::{Extension, Json};
use std::sync::Arc;

use super::types::{SyncReport, SyncRequest, SyncState};
use crate::dispatch::service::ModelDispatcher;
use crate::error::Result;
use crate::node::ClusterNode;

/// Reports this node's loaded models and running load tasks.
pub async fn handle_internal_sync(
    Extension(dispatcher): Extension<Arc<ModelDispatcher>>,
    Json(_req): Json<SyncRequest>,
) -> Json<SyncState> {
    Json(dispatcher.sync_state())
}

pub async fn handle_sync(
    Extension(node): Extension<Arc<ClusterNode>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncReport>> {
    tracing::info!("Sync ({:?}) requested through the API", req.mode);
    Ok(Json(node.reconciler.run_pass(req.mode).await?))
}
