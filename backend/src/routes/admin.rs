//! Admin API routes.
//!
//! Provides:
//! - Node status overwrite (`/admin/nodes/:id/status`)
//! - Routing table replacement (`/admin/routing/rules`)

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::put,
    Json, Router,
};
use serde_json::json;

use dispatch_common::{NodeInfo, NodeStatusUpdate, RoutingRulesResponse};

use crate::config::RoutingConfig;
use crate::error::DispatchError;
use crate::AppState;

/// Middleware that requires the configured admin bearer token.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.server.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected);

    match presented {
        Some(true) => next.run(request).await,
        Some(false) => {
            tracing::warn!(path = %request.uri().path(), "Rejected admin request with wrong token");
            (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": { "type": "forbidden", "message": "Invalid admin token" } })),
            )
                .into_response()
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "type": "unauthorized", "message": "Admin token required" } })),
        )
            .into_response(),
    }
}

/// PUT /admin/nodes/:id/status - Overwrite a node's usage and status
async fn update_node_status(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(update): Json<NodeStatusUpdate>,
) -> Result<Json<NodeInfo>, DispatchError> {
    let snapshot = state.registry.update_status(
        &node_id,
        update.used_capacity,
        update.compute_utilization,
        update.status,
    )?;
    Ok(Json(snapshot.to_info()))
}

/// PUT /admin/routing/rules - Replace the routing table
async fn replace_routing_rules(
    State(state): State<Arc<AppState>>,
    Json(routing): Json<RoutingConfig>,
) -> Result<Json<RoutingRulesResponse>, DispatchError> {
    state.classifier.reload(&routing)?;
    tracing::info!(rules = routing.rules.len(), "Routing rules replaced");
    Ok(Json(state.classifier.rules()))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/nodes/:id/status", put(update_node_status))
        .route("/routing/rules", put(replace_routing_rules))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}
