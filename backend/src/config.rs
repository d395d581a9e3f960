//! Configuration for the dispatch gateway.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static node inventory. Nodes are never added or removed at runtime.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required by `/admin` routes. Unset leaves them open.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A compute node and the models it hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub hostname: String,
    /// Base URL of the node's OpenAI-compatible API (e.g. "http://10.0.0.12:8080").
    pub url: String,
    /// Capacity budget in abstract units (e.g. VRAM GB).
    pub total_capacity: f64,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Endpoint call and availability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Default per-call timeout.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Consecutive failures before an endpoint is marked unavailable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an endpoint stays unavailable before it is tried again.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Scheduling, fan-out and queueing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of nodes a parallel job fans out to.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Minimum successful parallel results before merging.
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    /// Maximum number of queued jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Slack added to the per-call timeout for the fan-out barrier.
    #[serde(default = "default_dispatch_overhead_ms")]
    pub dispatch_overhead_ms: u64,
    /// Periodic queue retry interval, on top of release-triggered dispatch.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Capacity units reserved for models without an entry in `model_costs`.
    #[serde(default = "default_cost")]
    pub default_cost: f64,
    /// Per-model capacity cost.
    /// Example: { "adversarial-reasoner" = 24.0, "parser-small" = 4.0 }
    #[serde(default)]
    pub model_costs: HashMap<String, f64>,
    /// Model used for ensemble synthesis. Without one, ensemble merges concatenate.
    #[serde(default)]
    pub synthesis_model: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            quorum: default_quorum(),
            queue_capacity: default_queue_capacity(),
            dispatch_overhead_ms: default_dispatch_overhead_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            default_cost: default_cost(),
            model_costs: HashMap::new(),
            synthesis_model: None,
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_overhead(&self) -> Duration {
        Duration::from_millis(self.dispatch_overhead_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// One task type and the hints that select it.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRuleConfig {
    pub task_type: String,
    pub model: String,
    /// Keywords (case-insensitive substring) or `re:`-prefixed regular expressions.
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// Task type table. Rule order is the tie-break order.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_task_type")]
    pub default_task_type: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    #[serde(default)]
    pub rules: Vec<RoutingRuleConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_task_type: default_task_type(),
            default_model: default_model(),
            default_priority: default_priority(),
            rules: vec![],
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_health_check_interval() -> u64 {
    15
}
fn default_max_parallel() -> usize {
    3
}
fn default_quorum() -> usize {
    1
}
fn default_queue_capacity() -> usize {
    256
}
fn default_dispatch_overhead_ms() -> u64 {
    250
}
fn default_dispatch_interval_ms() -> u64 {
    500
}
fn default_cost() -> f64 {
    1.0
}
fn default_task_type() -> String {
    "general_reasoning".to_string()
}
fn default_model() -> String {
    "generalist".to_string()
}
fn default_priority() -> u8 {
    5
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (DISPATCH__SECTION__KEY format)
    /// 2. The file named by `DISPATCH_CONFIG`, or `config.toml` (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DISPATCH_CONFIG").unwrap_or_else(|_| "config".to_string());
        let config = ConfigLoader::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = ConfigLoader::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = ConfigLoader::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inventories the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Message(format!("duplicate node id '{}'", node.id)));
            }
            if !(node.total_capacity.is_finite() && node.total_capacity > 0.0) {
                return Err(ConfigError::Message(format!(
                    "node '{}' must have a positive total_capacity",
                    node.id
                )));
            }
        }
        if self.scheduler.max_parallel == 0 {
            return Err(ConfigError::Message("scheduler.max_parallel must be at least 1".into()));
        }
        if self.scheduler.quorum == 0 {
            return Err(ConfigError::Message("scheduler.quorum must be at least 1".into()));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::Message("scheduler.queue_capacity must be at least 1".into()));
        }
        if self.gateway.failure_threshold == 0 {
            return Err(ConfigError::Message("gateway.failure_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [server]
        port = 9000

        [[nodes]]
        id = "gpu-a"
        hostname = "gpu-a.internal"
        url = "http://10.0.0.10:8080"
        total_capacity = 48.0
        models = ["adversarial-reasoner", "generalist"]

        [[nodes]]
        id = "gpu-b"
        hostname = "gpu-b.internal"
        url = "http://10.0.0.11:8080"
        total_capacity = 24.0
        models = ["polyglot"]

        [scheduler]
        quorum = 2
        synthesis_model = "generalist"
        model_costs = { "adversarial-reasoner" = 24.0 }

        [routing]
        default_model = "generalist"

        [[routing.rules]]
        task_type = "adversarial_reasoning"
        model = "adversarial-reasoner"
        hints = ["adversary", "re:\\bapt\\d+\\b"]
        priority = 1
    "#;

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.max_parallel, 3);
        assert_eq!(scheduler.quorum, 1);
        assert_eq!(scheduler.queue_capacity, 256);
        assert!(scheduler.synthesis_model.is_none());

        let gateway = GatewayConfig::default();
        assert_eq!(gateway.call_timeout(), Duration::from_secs(30));
        assert_eq!(gateway.failure_threshold, 3);
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].models, vec!["adversarial-reasoner", "generalist"]);
        assert_eq!(config.scheduler.quorum, 2);
        assert_eq!(config.scheduler.max_parallel, 3);
        assert_eq!(config.routing.rules.len(), 1);
        assert_eq!(config.routing.rules[0].priority, 1);
        assert_eq!(config.routing.default_priority, 5);
    }

    #[test]
    fn test_model_costs_parsed() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.scheduler.model_costs.get("adversarial-reasoner"), Some(&24.0));
        assert!(config.scheduler.model_costs.get("polyglot").is_none());
        assert_eq!(config.scheduler.default_cost, 1.0);
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let toml = r#"
            [[nodes]]
            id = "n1"
            hostname = "a"
            url = "http://a"
            total_capacity = 8.0

            [[nodes]]
            id = "n1"
            hostname = "b"
            url = "http://b"
            total_capacity = 8.0
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let toml = r#"
            [[nodes]]
            id = "n1"
            hostname = "a"
            url = "http://a"
            total_capacity = 0.0
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_zero_quorum_rejected() {
        let toml = r#"
            [scheduler]
            quorum = 0
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.nodes[1].id, "gpu-b");
        assert_eq!(config.scheduler.synthesis_model.as_deref(), Some("generalist"));
    }
}
