use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use dispatch_common::NodesResponse;

use crate::AppState;

/// GET /nodes - Node inventory with live capacity
async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<NodesResponse> {
    let nodes: Vec<_> = state.registry.all().iter().map(|n| n.to_info()).collect();
    Json(NodesResponse {
        available_count: state.registry.available_count(),
        nodes,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .with_state(state)
}
