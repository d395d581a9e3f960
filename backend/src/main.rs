use std::sync::Arc;

use axum::middleware;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_backend::{app, logging, AppState, Config, HttpModelClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dispatch gateway");
    for node in &config.nodes {
        tracing::info!(
            "Node {} at {} ({} capacity units, models: {})",
            node.id,
            node.url,
            node.total_capacity,
            node.models.join(", ")
        );
    }
    if config.nodes.is_empty() {
        tracing::warn!("No compute nodes configured; every job will fail to schedule");
    }

    let client = Arc::new(HttpModelClient::new()?);
    let state = Arc::new(AppState::build(config.clone(), client)?);

    let shutdown = CancellationToken::new();
    let background = state.spawn_background(shutdown.clone());

    let app = app(state)
        .layer(middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("Dispatch gateway stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
