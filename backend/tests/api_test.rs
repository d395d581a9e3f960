use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde_json::{json, Value};
use tower::ServiceExt;

use dispatch_backend::test_util::{test_config, test_state, Behavior, ScriptedClient};
use dispatch_backend::{app, AppState};

async fn send_request(
    app: &axum::Router,
    method: http::Method,
    uri: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut req_builder = http::Request::builder().method(method).uri(uri);

    if body.is_some() {
        req_builder = req_builder.header("Content-Type", "application/json");
    }
    if let Some(token) = token {
        req_builder = req_builder.header("Authorization", format!("Bearer {}", token));
    }

    let req = req_builder
        .body(match body {
            Some(b) => axum::body::Body::from(Bytes::from(b.to_string())),
            None => axum::body::Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn scripted() -> (Arc<ScriptedClient>, axum::Router) {
    let client = Arc::new(ScriptedClient::new());
    let router = app(test_state(client.clone()));
    (client, router)
}

#[tokio::test]
async fn test_health() {
    let (_, app) = scripted();
    let (status, body) = send_request(&app, http::Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_report_capacity_and_queue() {
    let (_, app) = scripted();
    let req = http::Request::builder()
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("dispatch_node_capacity_total{node=\"gpu-a\"} 4"));
    assert!(text.contains("dispatch_queue_depth 0"));
    assert!(text.contains("dispatch_queue_capacity 8"));
    assert!(text.contains("dispatch_endpoints_total 5"));
}

#[tokio::test]
async fn test_process_routes_and_completes() {
    let (client, app) = scripted();
    client.script("adversarial-reasoner", Behavior::reply("credential harvesting"));

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({ "prompt": "is this a phishing email?" })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["execution_mode"], "single");
    assert_eq!(body["routing"]["task_type"], "adversarial_reasoning");
    assert_eq!(body["routing"]["model"], "adversarial-reasoner");
    assert_eq!(body["routing"]["priority"], 1);
    assert_eq!(body["scheduling"]["nodes"], json!(["gpu-a"]));
    assert_eq!(body["result"]["output"], "credential harvesting");
    assert!(body.get("error").is_none());

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].node_id, "gpu-a");
}

#[tokio::test]
async fn test_process_without_hints_uses_default_model() {
    let (_, app) = scripted();
    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({ "prompt": "summarise the meeting notes" })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routing"]["task_type"], "general_reasoning");
    assert_eq!(body["routing"]["model"], "generalist");
    assert_eq!(body["routing"]["fallback"], true);
    assert_eq!(body["result"]["output"], "generalist response");
}

#[tokio::test]
async fn test_process_rejects_empty_prompt() {
    let (client, app) = scripted();
    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({ "prompt": "   " })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_process_failure_carries_job_and_stage() {
    let (client, app) = scripted();
    client.script("polyglot", Behavior::Fail(400));

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({ "prompt": "hola", "task_hints": ["translate"] })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["type"], "call_failed");
    assert_eq!(body["error"]["stage"], "execution");
    assert_eq!(body["error"]["job_id"], body["job_id"]);
}

#[tokio::test]
async fn test_process_parallel_consensus() {
    let (client, app) = scripted();
    client.script_on("gpu-a", "generalist", Behavior::reply("benign"));
    client.script_on("gpu-b", "generalist", Behavior::reply("benign"));

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({
            "prompt": "triage this alert",
            "requires_parallel": true,
            "parameters": { "merge_strategy": "consensus" }
        })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["execution_mode"], "parallel");
    assert_eq!(body["result"]["output"], "benign");
    assert_eq!(body["result"]["merge"]["strategy"], "consensus");
}

#[tokio::test]
async fn test_detached_job_is_read_once() {
    let (client, app) = scripted();
    client.script(
        "generalist",
        Behavior::Delayed {
            delay: Duration::from_millis(20),
            content: "later".to_string(),
        },
    );

    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/process",
        Some(json!({ "prompt": "background work", "parameters": { "detach": true } })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    let uri = format!("/jobs/{}", job_id);

    let mut finished = None;
    for _ in 0..100 {
        let (status, body) = send_request(&app, http::Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "completed" {
            finished = Some(body);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let finished = finished.expect("detached job should complete");
    assert_eq!(finished["result"]["output"], "later");

    let (status, body) = send_request(&app, http::Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "job_not_found");
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let (_, app) = scripted();
    let (status, body) =
        send_request(&app, http::Method::POST, "/jobs/nope/cancel", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "job_not_found");
}

#[tokio::test]
async fn test_classify_is_a_dry_run() {
    let (client, app) = scripted();
    let (status, body) = send_request(
        &app,
        http::Method::POST,
        "/classify",
        Some(json!({ "prompt": "bonjour", "task_hints": ["Translate to English"] })),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routing"]["task_type"], "translation");
    assert_eq!(body["routing"]["model"], "polyglot");
    assert_eq!(body["matched_hints"], json!(["translate"]));
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn test_list_models_and_nodes() {
    let (_, app) = scripted();

    let (status, body) = send_request(&app, http::Method::GET, "/models", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert!(body["models"]
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["is_available"] == true));

    let (status, body) = send_request(&app, http::Method::GET, "/nodes", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available_count"], 2);
    assert_eq!(body["nodes"][0]["node_id"], "gpu-a");
    assert_eq!(body["nodes"][1]["models_loaded"], json!(["generalist", "polyglot", "parser-small"]));
}

#[tokio::test]
async fn test_routing_rules_listed() {
    let (_, app) = scripted();
    let (status, body) = send_request(&app, http::Method::GET, "/routing/rules", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["default_model"], "generalist");
    assert_eq!(body["rules"].as_array().unwrap().len(), 3);
    assert_eq!(body["rules"][0]["task_type"], "adversarial_reasoning");
}

#[tokio::test]
async fn test_admin_updates_node_status() {
    let (_, app) = scripted();
    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/admin/nodes/gpu-b/status",
        Some(json!({ "used_capacity": 1.5, "compute_utilization": 0.7, "status": "degraded" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["used_capacity"], 1.5);

    let (_, body) = send_request(&app, http::Method::GET, "/nodes", None, None).await;
    assert_eq!(body["available_count"], 1);

    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/admin/nodes/gpu-z/status",
        Some(json!({ "used_capacity": 0.0, "compute_utilization": 0.0, "status": "available" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "node_not_found");
}

#[tokio::test]
async fn test_admin_replaces_routing_rules() {
    let (_, app) = scripted();

    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/admin/routing/rules",
        Some(json!({ "rules": [{ "task_type": "broken", "model": "generalist", "hints": ["re:("] }] })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_routing_rules");

    let (status, body) = send_request(
        &app,
        http::Method::PUT,
        "/admin/routing/rules",
        Some(json!({
            "default_model": "generalist",
            "rules": [{ "task_type": "structured_parsing", "model": "parser-small", "hints": ["csv"] }]
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rules"].as_array().unwrap().len(), 1);

    let (_, body) = send_request(
        &app,
        http::Method::POST,
        "/classify",
        Some(json!({ "prompt": "turn this csv into rows" })),
        None,
    )
    .await;
    assert_eq!(body["routing"]["model"], "parser-small");
}

#[tokio::test]
async fn test_admin_requires_token_when_configured() {
    let mut config = test_config();
    config.server.admin_token = Some("s3cret".to_string());
    let state = AppState::build(config, Arc::new(ScriptedClient::new())).unwrap();
    let app = app(Arc::new(state));
    let update = json!({ "used_capacity": 0.0, "compute_utilization": 0.0, "status": "available" });

    let (status, _) = send_request(
        &app,
        http::Method::PUT,
        "/admin/nodes/gpu-a/status",
        Some(update.clone()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_request(
        &app,
        http::Method::PUT,
        "/admin/nodes/gpu-a/status",
        Some(update.clone()),
        Some("wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_request(
        &app,
        http::Method::PUT,
        "/admin/nodes/gpu-a/status",
        Some(update),
        Some("s3cret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Read-only routes stay open.
    let (status, _) = send_request(&app, http::Method::GET, "/nodes", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
