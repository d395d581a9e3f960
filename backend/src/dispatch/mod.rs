//! Dispatch core.
//!
//! This module provides:
//! - Node registry with per-node capacity reservations
//! - Endpoint gateway for time-bounded model calls
//! - Hint-based classifier that routes requests to task types and models
//! - Scheduler driving single, parallel and chained execution
//! - Merger reconciling multi-source results
//! - Priority queue and dispatcher for jobs waiting on capacity

pub mod classifier;
pub mod client;
pub mod dispatcher;
pub mod endpoint;
pub mod health;
pub mod job;
pub mod merger;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use classifier::{Classifier, ClassifierError, RoutingDecision};
pub use client::HttpModelClient;
pub use dispatcher::QueueDispatcher;
pub use endpoint::{CallError, EndpointGateway, ModelClient, ModelEndpoint};
pub use health::HealthMonitor;
pub use job::{Job, JobOutcome, JobStore};
pub use queue::{JobQueue, QueueFull};
pub use registry::{NodeRegistry, NodeSpec, Reservation};
pub use scheduler::{ExecutionPlan, Scheduler, Submission};
