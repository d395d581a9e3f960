use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use dispatch_common::RoutingRulesResponse;

use crate::AppState;

/// GET /routing/rules - Current task type to model table
async fn routing_rules(State(state): State<Arc<AppState>>) -> Json<RoutingRulesResponse> {
    Json(state.classifier.rules())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/routing/rules", get(routing_rules))
        .with_state(state)
}
