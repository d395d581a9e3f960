//! Process request/response types.

use serde::{Deserialize, Serialize};

/// How a job was (or will be) executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One model on one node.
    Single,
    /// Fan-out across distinct nodes, results merged.
    Parallel,
    /// Dependent steps, each fed the previous step's output.
    Chain,
    /// Waiting for capacity.
    Queued,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Parallel => "parallel",
            Self::Chain => "chain",
            Self::Queued => "queued",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy used to reconcile multiple results into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Largest group of equivalent answers wins.
    Consensus,
    /// Highest reported confidence wins.
    Weighted,
    /// All answers, tagged by model, in arrival order.
    #[default]
    Concatenate,
    /// Highest heuristic quality score wins.
    BestQuality,
    /// A synthesis model combines all answers.
    Ensemble,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consensus => "consensus",
            Self::Weighted => "weighted",
            Self::Concatenate => "concatenate",
            Self::BestQuality => "best_quality",
            Self::Ensemble => "ensemble",
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of a chained job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepSpec {
    pub task_type: String,
    pub model: String,
}

/// Optional execution parameters supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParameters {
    /// Models to fan out to when parallel execution is requested.
    #[serde(default)]
    pub models: Vec<String>,
    /// Ordered steps when chaining is requested.
    #[serde(default)]
    pub chain: Vec<ChainStepSpec>,
    /// How parallel results are merged (default: concatenate).
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    /// Capacity units to reserve per node; overrides the configured model cost.
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    /// Per-call timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Return immediately instead of waiting for the job to finish.
    #[serde(default)]
    pub detach: bool,
}

/// Body of `POST /process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub prompt: String,
    #[serde(default)]
    pub task_hints: Vec<String>,
    #[serde(default)]
    pub requires_parallel: bool,
    #[serde(default)]
    pub requires_chaining: bool,
    /// Explicit priority (lower is more urgent); overrides the task type weight.
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub parameters: Option<JobParameters>,
    /// Opaque caller identity, echoed into logs only.
    #[serde(default)]
    pub caller: Option<String>,
}

impl ProcessRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            task_hints: vec![],
            requires_parallel: false,
            requires_chaining: false,
            priority: None,
            parameters: None,
            caller: None,
        }
    }

    pub fn with_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_hints = hints.into_iter().map(Into::into).collect();
        self
    }

    pub fn parameters(&self) -> JobParameters {
        self.parameters.clone().unwrap_or_default()
    }
}

/// Routing decision as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub task_type: String,
    pub model: String,
    pub priority: u8,
    /// True when no rule matched and the default was used.
    #[serde(default)]
    pub fallback: bool,
}

/// Scheduling decision as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingInfo {
    pub execution_mode: ExecutionMode,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub strategy: MergeStrategy,
    /// Models that contributed to the merged output.
    pub sources: Vec<String>,
    /// Set when ensemble synthesis failed and concatenation was used instead.
    #[serde(default)]
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStepOutput {
    pub step: usize,
    pub task_type: String,
    pub model: String,
    pub node_id: String,
    pub output: String,
}

/// Outcome payload of an executed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    /// Completed chain steps, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<ChainStepOutput>,
    /// Set when the result is partial (a chain step failed).
    #[serde(default)]
    pub failed: bool,
    pub latency_ms: u64,
}

/// Error details attached to failed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Response of `POST /process` and `GET /jobs/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub routing: RoutingInfo,
    pub scheduling: SchedulingInfo,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Response of `POST /classify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyResponse {
    pub routing: RoutingInfo,
    pub score: u32,
    pub matched_hints: Vec<String>,
}
