//! Node, model endpoint and routing table views.

use serde::{Deserialize, Serialize};

/// Operational state of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Accepting reservations.
    #[default]
    Available,
    /// Reachable but not accepting new work.
    Degraded,
    /// Unreachable.
    Offline,
}

impl NodeStatus {
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub hostname: String,
    pub total_capacity: f64,
    pub used_capacity: f64,
    pub compute_utilization: f64,
    pub status: NodeStatus,
    pub models_loaded: Vec<String>,
}

/// Response of `GET /nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
    pub available_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEndpointInfo {
    pub model_name: String,
    pub node_id: String,
    pub endpoint_url: String,
    pub is_available: bool,
}

/// Response of `GET /models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelEndpointInfo>,
    pub total: usize,
}

/// Body of `PUT /admin/nodes/:id/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusUpdate {
    pub used_capacity: f64,
    pub compute_utilization: f64,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleInfo {
    pub task_type: String,
    pub model: String,
    #[serde(default)]
    pub hints: Vec<String>,
    pub priority: u8,
}

/// Response of `GET /routing/rules`; also the body of the reload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRulesResponse {
    pub rules: Vec<RoutingRuleInfo>,
    pub default_task_type: String,
    pub default_model: String,
    pub default_priority: u8,
}
