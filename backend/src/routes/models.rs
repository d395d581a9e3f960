//! Model endpoint listing.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use dispatch_common::ModelsResponse;

use crate::AppState;

/// GET /models - Every (node, model) endpoint with its availability
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.gateway.list();
    Json(ModelsResponse {
        total: models.len(),
        models,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .with_state(state)
}
