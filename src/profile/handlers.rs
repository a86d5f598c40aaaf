use axum::{Extension, Json};
use std::sync::Arc;

use super::types::{NodeProfile, ProfileFilter, ProfileResponse};
use crate::dispatch::service::ModelDispatcher;
use crate::node::ClusterNode;

pub async fn handle_internal_profile(
    Extension(dispatcher): Extension<Arc<ModelDispatcher>>,
    Json(filter): Json<ProfileFilter>,
) -> Json<NodeProfile> {
    Json(dispatcher.local_profile(&filter))
}

/// Cluster-wide snapshot. Partial failures are part of the response body.
pub async fn handle_profile(
    Extension(node): Extension<Arc<ClusterNode>>,
    Json(filter): Json<ProfileFilter>,
) -> Json<ProfileResponse> {
    Json(node.profiler.gather_profile(filter).await)
}
