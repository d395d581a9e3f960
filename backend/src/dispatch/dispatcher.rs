//! Queue dispatcher.
//!
//! Runs an async loop that retries queued jobs whenever node capacity is
//! freed, a job is queued, or the periodic interval elapses (endpoint
//! cool-downs expire without any release event).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::registry::NodeRegistry;
use super::scheduler::Scheduler;

pub struct QueueDispatcher {
    scheduler: Arc<Scheduler>,
    registry: Arc<NodeRegistry>,
    interval: Duration,
}

impl QueueDispatcher {
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<NodeRegistry>, interval: Duration) -> Self {
        Self {
            scheduler,
            registry,
            interval,
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut capacity_events = self.registry.capacity_events();
        let notify = self.scheduler.queue().notifier();
        tracing::info!("Queue dispatcher started (interval {}ms)", self.interval.as_millis());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = capacity_events.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.scheduler.queue().is_empty() {
                continue;
            }
            let started = self.scheduler.try_dispatch();
            if started > 0 {
                tracing::debug!(
                    started,
                    remaining = self.scheduler.queue().len(),
                    "dispatched queued jobs"
                );
            }
        }

        tracing::info!("Queue dispatcher stopped");
    }
}
