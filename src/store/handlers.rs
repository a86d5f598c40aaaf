use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::SharedStore;
use super::protocol::{ListModelsResponse, PutTaskResponse, StoreAck};
use crate::chunk::types::{ModelChunk, ModelMeta, ModelStateUpdate};
use crate::error::{ClusterError, ErrorResponse, Result};
use crate::task::types::{MlTask, TaskId, TaskUpdate};

pub async fn handle_list_models(
    Extension(store): Extension<SharedStore>,
) -> Result<Json<ListModelsResponse>> {
    let models = store.list_models().await?;
    Ok(Json(ListModelsResponse { models }))
}

pub async fn handle_get_model(
    Extension(store): Extension<SharedStore>,
    Path(model_id): Path<String>,
) -> Result<Json<ModelMeta>> {
    Ok(Json(store.get_model_meta(&model_id).await?))
}

pub async fn handle_put_model(
    Extension(store): Extension<SharedStore>,
    Json(meta): Json<ModelMeta>,
) -> Result<Json<StoreAck>> {
    store.put_model_meta(&meta).await?;
    Ok(Json(StoreAck { success: true }))
}

pub async fn handle_update_model_state(
    Extension(store): Extension<SharedStore>,
    Path(model_id): Path<String>,
    Json(update): Json<ModelStateUpdate>,
) -> Result<Json<StoreAck>> {
    store.update_model_state(&model_id, &update).await?;
    Ok(Json(StoreAck { success: true }))
}

pub async fn handle_get_chunk(
    Extension(store): Extension<SharedStore>,
    Path((model_id, index)): Path<(String, u32)>,
) -> Response {
    match store.get_chunk(&model_id, index).await {
        Ok(chunk) => Json(chunk).into_response(),
        // missing chunk -> 404
        Err(ClusterError::Store(error)) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse { error })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn handle_put_chunk(
    Extension(store): Extension<SharedStore>,
    Json(chunk): Json<ModelChunk>,
) -> Result<Json<StoreAck>> {
    store.put_chunk(&chunk).await?;
    Ok(Json(StoreAck { success: true }))
}

pub async fn handle_put_task(
    Extension(store): Extension<SharedStore>,
    Json(task): Json<MlTask>,
) -> Result<Json<PutTaskResponse>> {
    let task_id = store.put_task_record(&task).await?;
    Ok(Json(PutTaskResponse { task_id }))
}

pub async fn handle_update_task(
    Extension(store): Extension<SharedStore>,
    Path(task_id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<StoreAck>> {
    store
        .update_task_record(&TaskId(task_id), &update)
        .await?;
    Ok(Json(StoreAck { success: true }))
}

pub async fn handle_get_task(
    Extension(store): Extension<SharedStore>,
    Path(task_id): Path<String>,
) -> Result<Json<MlTask>> {
    store
        .get_task_record(&TaskId(task_id.clone()))
        .await?
        .map(Json)
        .ok_or(ClusterError::TaskNotFound(task_id))
}
