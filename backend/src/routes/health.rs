use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let mut body = format!(
        "# HELP dispatch_up Whether the service is up\n\
         # TYPE dispatch_up gauge\n\
         dispatch_up 1\n\
         # HELP dispatch_info Service information\n\
         # TYPE dispatch_info gauge\n\
         dispatch_info{{version=\"{}\"}} 1\n",
        version
    );

    let nodes = state.registry.all();
    body.push_str(
        "# HELP dispatch_node_capacity_total Capacity budget of a node\n\
         # TYPE dispatch_node_capacity_total gauge\n",
    );
    for node in &nodes {
        let _ = writeln!(body, "dispatch_node_capacity_total{{node=\"{}\"}} {}", node.id, node.total_capacity);
    }
    body.push_str(
        "# HELP dispatch_node_capacity_used Capacity currently reserved on a node\n\
         # TYPE dispatch_node_capacity_used gauge\n",
    );
    for node in &nodes {
        let _ = writeln!(body, "dispatch_node_capacity_used{{node=\"{}\"}} {}", node.id, node.used_capacity);
    }
    body.push_str(
        "# HELP dispatch_node_utilization Reported compute utilization of a node\n\
         # TYPE dispatch_node_utilization gauge\n",
    );
    for node in &nodes {
        let _ = writeln!(body, "dispatch_node_utilization{{node=\"{}\"}} {}", node.id, node.compute_utilization);
    }

    let endpoints = state.gateway.list();
    let available = endpoints.iter().filter(|e| e.is_available).count();
    let _ = write!(
        body,
        "# HELP dispatch_queue_depth Jobs waiting for capacity\n\
         # TYPE dispatch_queue_depth gauge\n\
         dispatch_queue_depth {}\n\
         # HELP dispatch_queue_capacity Maximum jobs the queue holds\n\
         # TYPE dispatch_queue_capacity gauge\n\
         dispatch_queue_capacity {}\n\
         # HELP dispatch_jobs_tracked Jobs queued, running or awaiting pickup\n\
         # TYPE dispatch_jobs_tracked gauge\n\
         dispatch_jobs_tracked {}\n\
         # HELP dispatch_endpoints_available Model endpoints currently accepting calls\n\
         # TYPE dispatch_endpoints_available gauge\n\
         dispatch_endpoints_available {}\n\
         # HELP dispatch_endpoints_total Configured model endpoints\n\
         # TYPE dispatch_endpoints_total gauge\n\
         dispatch_endpoints_total {}\n",
        state.queue.len(),
        state.queue.capacity(),
        state.jobs.len(),
        available,
        endpoints.len()
    );

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
