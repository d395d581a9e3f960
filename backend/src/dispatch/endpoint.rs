//! Endpoint gateway: time-bounded model calls and endpoint availability.
//!
//! Every call goes through [`EndpointGateway::invoke`], which bounds it by a
//! timeout, aborts it on cancellation and feeds the outcome back into the
//! endpoint's availability record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use dispatch_common::{ChatCompletionRequest, ChatCompletionResponse, ModelEndpointInfo};

use super::registry::NodeRegistry;
use crate::config::GatewayConfig;

/// A model served by a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelEndpoint {
    pub model: String,
    pub node_id: String,
    pub url: String,
}

/// Payload of a single model call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CallRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    fn to_chat(&self, model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest::from_prompt(model, &self.prompt)
            .with_sampling(self.temperature, self.max_tokens)
    }
}

/// Successful call result.
#[derive(Debug, Clone)]
pub struct CallOutput {
    pub content: String,
    pub confidence: Option<f32>,
    /// The node stopped because it hit its token limit.
    pub truncated: bool,
    pub latency: Duration,
}

/// Errors from a single model call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("call to '{model}' on node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout {
        node_id: String,
        model: String,
        timeout_ms: u64,
    },
    #[error("failed to connect to node '{node_id}': {message}")]
    Transport { node_id: String, message: String },
    #[error("node '{node_id}' returned HTTP {status}: {body}")]
    Status {
        node_id: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from node '{node_id}': {message}")]
    InvalidResponse { node_id: String, message: String },
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    /// Failures worth retrying on another node.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidResponse { .. } | Self::Cancelled => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Outcome of one call in a fan-out.
#[derive(Debug)]
pub struct CallResult {
    pub endpoint: ModelEndpoint,
    pub outcome: Result<CallOutput, CallError>,
}

/// Transport used to reach model endpoints.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one chat completion against the endpoint.
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, CallError>;

    /// Check whether the node behind `node_url` is responsive.
    async fn health(&self, node_id: &str, node_url: &str) -> bool;
}

#[derive(Debug, Default)]
struct EndpointHealth {
    consecutive_failures: u32,
    unavailable_until: Option<Instant>,
}

impl EndpointHealth {
    fn is_available(&self, now: Instant) -> bool {
        match self.unavailable_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

/// Uniform call contract over every model endpoint.
pub struct EndpointGateway {
    client: Arc<dyn ModelClient>,
    /// Endpoints in registry order.
    endpoints: Vec<ModelEndpoint>,
    health: RwLock<HashMap<(String, String), EndpointHealth>>,
    call_timeout: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    barrier_overhead: Duration,
}

impl EndpointGateway {
    pub fn new(
        client: Arc<dyn ModelClient>,
        endpoints: Vec<ModelEndpoint>,
        config: &GatewayConfig,
        barrier_overhead: Duration,
    ) -> Self {
        let health = endpoints
            .iter()
            .map(|e| ((e.node_id.clone(), e.model.clone()), EndpointHealth::default()))
            .collect();
        Self {
            client,
            endpoints,
            health: RwLock::new(health),
            call_timeout: config.call_timeout(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            barrier_overhead,
        }
    }

    /// One endpoint per (node, hosted model).
    pub fn for_registry(
        client: Arc<dyn ModelClient>,
        registry: &NodeRegistry,
        config: &GatewayConfig,
        barrier_overhead: Duration,
    ) -> Self {
        let endpoints = registry
            .specs()
            .flat_map(|spec| {
                spec.models.iter().map(move |model| ModelEndpoint {
                    model: model.clone(),
                    node_id: spec.id.clone(),
                    url: spec.url.clone(),
                })
            })
            .collect();
        Self::new(client, endpoints, config, barrier_overhead)
    }

    pub fn default_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn endpoint(&self, node_id: &str, model: &str) -> Option<ModelEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.node_id == node_id && e.model == model)
            .cloned()
    }

    /// Whether calls to `model` on `node_id` are currently allowed.
    ///
    /// An endpoint whose cool-down has elapsed becomes available again.
    pub fn is_available(&self, node_id: &str, model: &str) -> bool {
        let key = (node_id.to_string(), model.to_string());
        let now = Instant::now();
        {
            let health = self.health.read();
            match health.get(&key) {
                None => return false,
                Some(h) if h.unavailable_until.is_none() => return true,
                Some(h) if !h.is_available(now) => return false,
                Some(_) => {}
            }
        }

        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&key) {
            if h.unavailable_until.is_some_and(|until| now >= until) {
                tracing::info!(node_id, model, "endpoint cool-down elapsed, marking available");
                h.unavailable_until = None;
                h.consecutive_failures = 0;
            }
            h.is_available(now)
        } else {
            false
        }
    }

    /// Endpoint listing with current availability.
    pub fn list(&self) -> Vec<ModelEndpointInfo> {
        self.endpoints
            .iter()
            .map(|e| ModelEndpointInfo {
                model_name: e.model.clone(),
                node_id: e.node_id.clone(),
                endpoint_url: e.url.clone(),
                is_available: self.is_available(&e.node_id, &e.model),
            })
            .collect()
    }

    /// Call one endpoint, bounded by `timeout` and aborted by `cancel`.
    ///
    /// On timeout or cancellation the in-flight request future is dropped,
    /// which aborts the underlying HTTP request.
    pub async fn invoke(
        &self,
        endpoint: &ModelEndpoint,
        request: &CallRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallOutput, CallError> {
        let chat = request.to_chat(&endpoint.model);
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            result = tokio::time::timeout(timeout, self.client.complete(endpoint, &chat)) => {
                match result {
                    Ok(response) => response,
                    Err(_) => Err(CallError::Timeout {
                        node_id: endpoint.node_id.clone(),
                        model: endpoint.model.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };

        match outcome {
            Ok(response) => {
                let Some(content) = response.content().map(str::to_string) else {
                    let err = CallError::InvalidResponse {
                        node_id: endpoint.node_id.clone(),
                        message: "response has no message content".to_string(),
                    };
                    self.record_failure(endpoint);
                    return Err(err);
                };
                self.record_success(endpoint);
                Ok(CallOutput {
                    content,
                    confidence: response.confidence,
                    truncated: response.finish_reason() == Some("length"),
                    latency: started.elapsed(),
                })
            }
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(err) => {
                if err.is_timeout() {
                    self.mark_unavailable(endpoint);
                } else {
                    self.record_failure(endpoint);
                }
                tracing::warn!(
                    node_id = %endpoint.node_id,
                    model = %endpoint.model,
                    error = %err,
                    "model call failed"
                );
                Err(err)
            }
        }
    }

    /// Call several endpoints concurrently.
    ///
    /// Each call is bounded by its own `timeout`; the whole fan-out by
    /// `timeout` plus the scheduling overhead. Results are returned in the
    /// order they arrived. Calls still pending at the barrier are abandoned
    /// and reported as timeouts.
    pub async fn invoke_many(
        &self,
        calls: Vec<(ModelEndpoint, CallRequest)>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Vec<CallResult> {
        let targets: Vec<ModelEndpoint> = calls.iter().map(|(e, _)| e.clone()).collect();
        let mut arrived = vec![false; targets.len()];
        let mut results = Vec::with_capacity(targets.len());

        let mut pending: FuturesUnordered<_> = calls
            .into_iter()
            .enumerate()
            .map(|(i, (endpoint, request))| async move {
                let outcome = self.invoke(&endpoint, &request, timeout, cancel).await;
                (i, CallResult { endpoint, outcome })
            })
            .collect();

        let barrier = timeout + self.barrier_overhead;
        let collect = async {
            while let Some((i, result)) = pending.next().await {
                arrived[i] = true;
                results.push(result);
            }
        };
        if tokio::time::timeout(barrier, collect).await.is_err() {
            tracing::warn!(
                barrier_ms = barrier.as_millis() as u64,
                "fan-out barrier elapsed with calls still pending"
            );
        }
        drop(pending);

        for (i, endpoint) in targets.into_iter().enumerate() {
            if !arrived[i] {
                let err = if cancel.is_cancelled() {
                    CallError::Cancelled
                } else {
                    self.mark_unavailable(&endpoint);
                    CallError::Timeout {
                        node_id: endpoint.node_id.clone(),
                        model: endpoint.model.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                };
                results.push(CallResult {
                    endpoint,
                    outcome: Err(err),
                });
            }
        }

        results
    }

    fn record_success(&self, endpoint: &ModelEndpoint) {
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&(endpoint.node_id.clone(), endpoint.model.clone())) {
            h.consecutive_failures = 0;
            h.unavailable_until = None;
        }
    }

    fn record_failure(&self, endpoint: &ModelEndpoint) {
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&(endpoint.node_id.clone(), endpoint.model.clone())) {
            h.consecutive_failures += 1;
            if h.consecutive_failures >= self.failure_threshold && h.unavailable_until.is_none() {
                tracing::warn!(
                    node_id = %endpoint.node_id,
                    model = %endpoint.model,
                    failures = h.consecutive_failures,
                    "endpoint marked unavailable"
                );
                h.unavailable_until = Some(Instant::now() + self.cooldown);
            }
        }
    }

    /// Take an endpoint out of rotation for the cool-down window.
    pub fn mark_unavailable(&self, endpoint: &ModelEndpoint) {
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(&(endpoint.node_id.clone(), endpoint.model.clone())) {
            h.consecutive_failures = h.consecutive_failures.max(self.failure_threshold);
            h.unavailable_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                node_id = %endpoint.node_id,
                model = %endpoint.model,
                cooldown_secs = self.cooldown.as_secs(),
                "endpoint cooling down"
            );
        }
    }

    /// Health-check nodes with unavailable endpoints; restore them on success.
    ///
    /// Returns the number of endpoints restored.
    pub async fn probe_unavailable(&self) -> usize {
        let now = Instant::now();
        let mut nodes: Vec<(String, String)> = {
            let health = self.health.read();
            self.endpoints
                .iter()
                .filter(|e| {
                    health
                        .get(&(e.node_id.clone(), e.model.clone()))
                        .is_some_and(|h| !h.is_available(now))
                })
                .map(|e| (e.node_id.clone(), e.url.clone()))
                .collect()
        };
        nodes.dedup();

        let mut restored = 0;
        for (node_id, url) in nodes {
            if !self.client.health(&node_id, &url).await {
                tracing::debug!(node_id = %node_id, "health probe failed");
                continue;
            }
            let mut health = self.health.write();
            for endpoint in self.endpoints.iter().filter(|e| e.node_id == node_id) {
                if let Some(h) = health.get_mut(&(endpoint.node_id.clone(), endpoint.model.clone())) {
                    if h.unavailable_until.is_some() {
                        h.unavailable_until = None;
                        h.consecutive_failures = 0;
                        restored += 1;
                    }
                }
            }
            tracing::info!(node_id = %node_id, "health probe succeeded, endpoints restored");
        }
        restored
    }
}
