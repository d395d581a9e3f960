//! Periodic health probing of unavailable endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::endpoint::EndpointGateway;

pub struct HealthMonitor {
    gateway: Arc<EndpointGateway>,
    interval: Duration,
    /// Woken when endpoints come back, so queued work is retried.
    wake: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(gateway: Arc<EndpointGateway>, interval: Duration, wake: Arc<Notify>) -> Self {
        Self {
            gateway,
            interval,
            wake,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let restored = self.gateway.probe_unavailable().await;
            if restored > 0 {
                tracing::info!("Health probe restored {} endpoints", restored);
                self.wake.notify_one();
            }
        }
    }
}
