pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod routes;
pub mod test_util;

pub use config::Config;
pub use dispatch::{
    Classifier, EndpointGateway, HttpModelClient, JobQueue, JobStore, ModelClient, NodeRegistry,
    Scheduler,
};
pub use error::{DispatchError, ExecutionStage, JobFailure};

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dispatch::{ClassifierError, HealthMonitor, QueueDispatcher};

/// Shared application state.
///
/// One instance of each component, built once at startup and handed to the
/// request handlers.
pub struct AppState {
    pub config: Config,
    /// Compute nodes and their capacity.
    pub registry: Arc<NodeRegistry>,
    /// Model calls and endpoint availability.
    pub gateway: Arc<EndpointGateway>,
    pub classifier: Classifier,
    pub scheduler: Arc<Scheduler>,
    /// Jobs waiting for capacity.
    pub queue: Arc<JobQueue>,
    /// Live jobs, for status and cancellation.
    pub jobs: Arc<JobStore>,
}

impl AppState {
    /// Wire up every component from `config`, calling nodes through `client`.
    pub fn build(config: Config, client: Arc<dyn ModelClient>) -> Result<Self, ClassifierError> {
        let classifier = Classifier::new(&config.routing)?;
        let registry = Arc::new(NodeRegistry::from_config(&config.nodes));
        let gateway = Arc::new(EndpointGateway::for_registry(
            client,
            &registry,
            &config.gateway,
            config.scheduler.dispatch_overhead(),
        ));
        let queue = Arc::new(JobQueue::new(config.scheduler.queue_capacity));
        let jobs = Arc::new(JobStore::new());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            gateway.clone(),
            queue.clone(),
            jobs.clone(),
            config.scheduler.clone(),
        ));

        Ok(Self {
            config,
            registry,
            gateway,
            classifier,
            scheduler,
            queue,
            jobs,
        })
    }

    /// Start the queue dispatcher and the endpoint health monitor.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let dispatcher = QueueDispatcher::new(
            self.scheduler.clone(),
            self.registry.clone(),
            self.config.scheduler.dispatch_interval(),
        );
        let monitor = HealthMonitor::new(
            self.gateway.clone(),
            self.config.gateway.health_check_interval(),
            self.queue.notifier(),
        );

        let dispatcher_shutdown = shutdown.clone();
        vec![
            tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await }),
            tokio::spawn(async move { monitor.run(shutdown).await }),
        ]
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::process::router(state.clone()))
        .merge(routes::models::router(state.clone()))
        .merge(routes::nodes::router(state.clone()))
        .merge(routes::routing::router(state.clone()))
        .nest("/admin", routes::admin::router(state))
}
