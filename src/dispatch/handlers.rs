use axum::{
    Extension, Json,
    extract::Path,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::protocol::{
    DispatchRequest, DispatchResponse, ForwardInput, LoadModelInput, NodeAck,
    RegisterModelRequest, UnloadModelInput,
};
use super::service::ModelDispatcher;
use crate::chunk::types::ModelMeta;
use crate::error::{ClusterError, Result};
use crate::membership::types::NodeId;
use crate::node::ClusterNode;
use crate::task::types::{MlTask, TaskId, TaskState};

// ------------------------------------------------------------
// Internal (node to node)
// ------------------------------------------------------------

pub async fn handle_internal_load(
    Extension(dispatcher): Extension<Arc<ModelDispatcher>>,
    Json(input): Json<LoadModelInput>,
) -> Json<NodeAck> {
    tracing::debug!(
        "Received load of model {} for task {} from {}",
        input.model_id,
        input.task_id,
        input.coordinating_node
    );
    Json(dispatcher.on_load_model_input(input))
}

pub async fn handle_internal_unload(
    Extension(dispatcher): Extension<Arc<ModelDispatcher>>,
    Json(input): Json<UnloadModelInput>,
) -> Json<NodeAck> {
    tracing::debug!(
        "Received unload of model {} for task {}",
        input.model_id,
        input.task_id
    );
    Json(dispatcher.on_unload_model_input(input))
}

pub async fn handle_internal_forward(
    Extension(dispatcher): Extension<Arc<ModelDispatcher>>,
    Json(input): Json<ForwardInput>,
) -> Result<Json<NodeAck>> {
    Ok(Json(dispatcher.on_forward(input).await?))
}

// ------------------------------------------------------------
// Public API
// ------------------------------------------------------------

pub async fn handle_register_model(
    Extension(node): Extension<Arc<ClusterNode>>,
    Json(req): Json<RegisterModelRequest>,
) -> Result<Json<ModelMeta>> {
    let payload = STANDARD
        .decode(req.content.as_bytes())
        .map_err(|e| ClusterError::InvalidRequest(format!("content is not base64: {}", e)))?;
    let model_id = req
        .model_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let meta = node.register_model(&model_id, &req.name, &payload).await?;
    Ok(Json(meta))
}

pub async fn handle_load_model(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path(model_id): Path<String>,
    body: Option<Json<DispatchRequest>>,
) -> Result<Json<DispatchResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let task_id = node.dispatcher.dispatch_load(&model_id, req.node_ids).await?;
    Ok(Json(DispatchResponse {
        task_id,
        state: format!("{:?}", TaskState::Created),
    }))
}

pub async fn handle_unload_model(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path(model_id): Path<String>,
    body: Option<Json<DispatchRequest>>,
) -> Result<Json<DispatchResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let task_id = node
        .dispatcher
        .dispatch_unload(&model_id, req.node_ids)
        .await?;
    Ok(Json(DispatchResponse {
        task_id,
        state: format!("{:?}", TaskState::Created),
    }))
}

pub async fn handle_get_task(
    Extension(node): Extension<Arc<ClusterNode>>,
    Path(task_id): Path<String>,
) -> Result<Json<MlTask>> {
    Ok(Json(node.dispatcher.get_task(&TaskId(task_id)).await?))
}

pub async fn handle_get_routing(
    Extension(node): Extension<Arc<ClusterNode>>,
) -> Json<BTreeMap<String, BTreeSet<NodeId>>> {
    Json(node.routing.snapshot())
}
