use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Middleware that logs HTTP requests; server errors are logged at WARN.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() {
        tracing::warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms,
            "HTTP request failed"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms,
            "HTTP request"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_logger_passes_response_through() {
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/boom", get(|| async { StatusCode::BAD_GATEWAY }))
            .layer(middleware::from_fn(request_logger));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
