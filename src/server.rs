//! HTTP router of a node.

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;

use crate::dispatch::handlers::{
    handle_get_routing, handle_get_task, handle_internal_forward, handle_internal_load,
    handle_internal_unload, handle_load_model, handle_register_model, handle_unload_model,
};
use crate::node::ClusterNode;
use crate::profile::handlers::{handle_internal_profile, handle_profile};
use crate::store::SharedStore;
use crate::store::handlers::{
    handle_get_chunk, handle_get_model, handle_get_task as handle_get_task_record,
    handle_list_models, handle_put_chunk, handle_put_model, handle_put_task, handle_update_model_state,
    handle_update_task,
};
use crate::store::protocol::{ENDPOINT_STORE_CHUNKS, ENDPOINT_STORE_MODELS, ENDPOINT_STORE_TASKS};
use crate::sync::handlers::{handle_internal_sync, handle_sync};
use crate::transport::protocol::{
    ENDPOINT_INTERNAL_FORWARD, ENDPOINT_INTERNAL_LOAD, ENDPOINT_INTERNAL_PROFILE,
    ENDPOINT_INTERNAL_SYNC, ENDPOINT_INTERNAL_UNLOAD,
};

/// Public API plus internal endpoints; `/store` routes too when this node
/// hosts the artifact store.
pub fn build_router(node: Arc<ClusterNode>, hosted_store: Option<SharedStore>) -> Router {
    let mut app = Router::new()
        .route("/models", post(handle_register_model))
        .route("/models/:id/load", post(handle_load_model))
        .route("/models/:id/unload", post(handle_unload_model))
        .route("/tasks/:id", get(handle_get_task))
        .route("/routing", get(handle_get_routing))
        .route("/sync", post(handle_sync))
        .route("/profile", post(handle_profile))
        .route(ENDPOINT_INTERNAL_LOAD, post(handle_internal_load))
        .route(ENDPOINT_INTERNAL_UNLOAD, post(handle_internal_unload))
        .route(ENDPOINT_INTERNAL_FORWARD, post(handle_internal_forward))
        .route(ENDPOINT_INTERNAL_SYNC, post(handle_internal_sync))
        .route(ENDPOINT_INTERNAL_PROFILE, post(handle_internal_profile));

    if let Some(store) = hosted_store {
        app = app.merge(store_router(store));
    }

    app.layer(Extension(node.dispatcher.clone()))
        .layer(Extension(node))
}

/// Routes of the hosted artifact store.
pub fn store_router(store: SharedStore) -> Router {
    Router::new()
        .route(
            ENDPOINT_STORE_MODELS,
            get(handle_list_models).post(handle_put_model),
        )
        .route(&format!("{}/:id", ENDPOINT_STORE_MODELS), get(handle_get_model))
        .route(
            &format!("{}/:id/state", ENDPOINT_STORE_MODELS),
            post(handle_update_model_state),
        )
        .route(
            &format!("{}/:id/chunks/:index", ENDPOINT_STORE_MODELS),
            get(handle_get_chunk),
        )
        .route(ENDPOINT_STORE_CHUNKS, post(handle_put_chunk))
        .route(ENDPOINT_STORE_TASKS, post(handle_put_task))
        .route(
            &format!("{}/:id", ENDPOINT_STORE_TASKS),
            get(handle_get_task_record).post(handle_update_task),
        )
        .layer(Extension(store))
}
