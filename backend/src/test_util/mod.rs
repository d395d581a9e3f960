pub mod mock_node;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use dispatch_common::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ProcessRequest};

use crate::config::{Config, GatewayConfig, SchedulerConfig};
use crate::dispatch::classifier::RoutingDecision;
use crate::dispatch::endpoint::{CallError, EndpointGateway, ModelClient, ModelEndpoint};
use crate::dispatch::job::{Job, JobStore};
use crate::dispatch::queue::JobQueue;
use crate::dispatch::registry::{NodeRegistry, NodeSpec};
use crate::dispatch::scheduler::Scheduler;
use crate::AppState;

/// Two nodes and a small routing table.
pub const TEST_CONFIG: &str = r#"
    [logging]
    level = "debug"

    [[nodes]]
    id = "gpu-a"
    hostname = "gpu-a.internal"
    url = "http://gpu-a:8080"
    total_capacity = 4.0
    models = ["generalist", "adversarial-reasoner"]

    [[nodes]]
    id = "gpu-b"
    hostname = "gpu-b.internal"
    url = "http://gpu-b:8080"
    total_capacity = 2.0
    models = ["generalist", "polyglot", "parser-small"]

    [gateway]
    call_timeout_ms = 2000

    [scheduler]
    queue_capacity = 8
    dispatch_interval_ms = 20

    [routing]
    default_task_type = "general_reasoning"
    default_model = "generalist"

    [[routing.rules]]
    task_type = "adversarial_reasoning"
    model = "adversarial-reasoner"
    hints = ["phishing", "malware", "re:\\bapt\\d+\\b"]
    priority = 1

    [[routing.rules]]
    task_type = "translation"
    model = "polyglot"
    hints = ["translate", "translation"]
    priority = 3

    [[routing.rules]]
    task_type = "structured_parsing"
    model = "parser-small"
    hints = ["parse", "extract", "json"]
    priority = 4
"#;

pub fn test_config() -> Config {
    Config::from_toml_str(TEST_CONFIG).expect("test config should parse")
}

/// Application state over `test_config()` calling nodes through `client`.
pub fn test_state(client: Arc<ScriptedClient>) -> Arc<AppState> {
    Arc::new(AppState::build(test_config(), client).expect("test routing rules should compile"))
}

/// What a scripted node does when called.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply {
        content: String,
        confidence: Option<f32>,
        finish_reason: Option<String>,
    },
    /// Answer with this HTTP status.
    Fail(u16),
    /// Never answer.
    Hang,
    /// Answer once the gate is notified.
    Gated { gate: Arc<Notify>, content: String },
    Delayed { delay: Duration, content: String },
}

impl Behavior {
    pub fn reply(content: &str) -> Self {
        Self::Reply {
            content: content.to_string(),
            confidence: None,
            finish_reason: Some("stop".to_string()),
        }
    }

    pub fn reply_with_confidence(content: &str, confidence: f32) -> Self {
        Self::Reply {
            content: content.to_string(),
            confidence: Some(confidence),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// A reply cut off by the token limit.
    pub fn truncated(content: &str) -> Self {
        Self::Reply {
            content: content.to_string(),
            confidence: None,
            finish_reason: Some("length".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub node_id: String,
    pub model: String,
    pub prompt: String,
}

/// In-process model client answering from per-model scripts.
///
/// Node-specific scripts win over model-wide ones. Unscripted models reply
/// with `"<model> response"`. Every node is healthy unless told otherwise.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<(Option<String>, String), Behavior>>,
    unhealthy: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, model: &str, behavior: Behavior) {
        self.scripts
            .lock()
            .insert((None, model.to_string()), behavior);
    }

    pub fn script_on(&self, node_id: &str, model: &str, behavior: Behavior) {
        self.scripts
            .lock()
            .insert((Some(node_id.to_string()), model.to_string()), behavior);
    }

    pub fn set_healthy(&self, node_id: &str, healthy: bool) {
        let mut unhealthy = self.unhealthy.lock();
        if healthy {
            unhealthy.remove(node_id);
        } else {
            unhealthy.insert(node_id.to_string());
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn behavior_for(&self, node_id: &str, model: &str) -> Behavior {
        let scripts = self.scripts.lock();
        scripts
            .get(&(Some(node_id.to_string()), model.to_string()))
            .or_else(|| scripts.get(&(None, model.to_string())))
            .cloned()
            .unwrap_or_else(|| Behavior::reply(&format!("{} response", model)))
    }
}

fn completion(model: &str, content: &str, confidence: Option<f32>, finish_reason: Option<String>) -> ChatCompletionResponse {
    let response = ChatCompletionResponse::new(
        model.to_string(),
        ChatMessage::assistant(content),
        finish_reason,
    );
    match confidence {
        Some(c) => response.with_confidence(c),
        None => response,
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, CallError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().push(RecordedCall {
            node_id: endpoint.node_id.clone(),
            model: endpoint.model.clone(),
            prompt,
        });

        let stop = Some("stop".to_string());
        match self.behavior_for(&endpoint.node_id, &endpoint.model) {
            Behavior::Reply {
                content,
                confidence,
                finish_reason,
            } => Ok(completion(&endpoint.model, &content, confidence, finish_reason)),
            Behavior::Fail(status) => Err(CallError::Status {
                node_id: endpoint.node_id.clone(),
                status,
                body: "scripted failure".to_string(),
            }),
            Behavior::Hang => std::future::pending().await,
            Behavior::Gated { gate, content } => {
                gate.notified().await;
                Ok(completion(&endpoint.model, &content, None, stop))
            }
            Behavior::Delayed { delay, content } => {
                tokio::time::sleep(delay).await;
                Ok(completion(&endpoint.model, &content, None, stop))
            }
        }
    }

    async fn health(&self, node_id: &str, _node_url: &str) -> bool {
        !self.unhealthy.lock().contains(node_id)
    }
}

pub fn node(id: &str, capacity: f64, models: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        hostname: format!("{}.internal", id),
        url: format!("http://{}:8080", id),
        total_capacity: capacity,
        models: models.iter().map(|m| m.to_string()).collect(),
    }
}

/// Scheduler wired to a scripted client, for driving jobs without HTTP.
pub struct Harness {
    pub client: Arc<ScriptedClient>,
    pub config: SchedulerConfig,
    pub registry: Arc<NodeRegistry>,
    pub gateway: Arc<EndpointGateway>,
    pub queue: Arc<JobQueue>,
    pub jobs: Arc<JobStore>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub fn new(nodes: Vec<NodeSpec>, scheduler: SchedulerConfig, gateway: GatewayConfig) -> Self {
        Self::with_client(Arc::new(ScriptedClient::new()), nodes, scheduler, gateway)
    }

    pub fn with_client(
        client: Arc<ScriptedClient>,
        nodes: Vec<NodeSpec>,
        scheduler: SchedulerConfig,
        gateway: GatewayConfig,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(nodes));
        let endpoint_gateway = Arc::new(EndpointGateway::for_registry(
            client.clone(),
            &registry,
            &gateway,
            scheduler.dispatch_overhead(),
        ));
        let queue = Arc::new(JobQueue::new(scheduler.queue_capacity));
        let jobs = Arc::new(JobStore::new());
        let sched = Arc::new(Scheduler::new(
            registry.clone(),
            endpoint_gateway.clone(),
            queue.clone(),
            jobs.clone(),
            scheduler.clone(),
        ));

        Self {
            client,
            config: scheduler,
            registry,
            gateway: endpoint_gateway,
            queue,
            jobs,
            scheduler: sched,
        }
    }
}

fn fallback_routing(request: &ProcessRequest, model: &str) -> RoutingDecision {
    RoutingDecision {
        task_type: "general_reasoning".to_string(),
        model: model.to_string(),
        priority: request.priority.unwrap_or(5),
        score: 0,
        fallback: true,
        matched_hints: Vec::new(),
    }
}

/// A job for `request` routed straight to `model`, bypassing the classifier.
pub fn routed_job(harness: &Harness, request: ProcessRequest, model: &str) -> Job {
    let routing = fallback_routing(&request, model);
    Job::from_request(request, routing, &harness.config, harness.gateway.default_timeout())
        .expect("test request should be valid")
}

/// A single-mode job with default settings.
pub fn test_job(prompt: &str) -> Job {
    let request = ProcessRequest::new(prompt);
    let routing = fallback_routing(&request, "generalist");
    Job::from_request(request, routing, &SchedulerConfig::default(), Duration::from_secs(30))
        .expect("test request should be valid")
}
