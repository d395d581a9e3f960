//! Error types surfaced by the dispatch gateway.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use dispatch_common::ErrorBody;

use crate::dispatch::classifier::ClassifierError;
use crate::dispatch::endpoint::CallError;
use crate::dispatch::merger::MergeError;
use crate::dispatch::queue::QueueFull;
use crate::dispatch::registry::RegistryError;

/// Errors that can terminate a request or a job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No node available for model '{model}': {reason}")]
    NodeUnavailable { model: String, reason: String },

    #[error("Job queue is full ({capacity} entries), retry later")]
    QueueFull { capacity: usize },

    #[error(transparent)]
    Call(CallError),

    #[error("Chain step {step} ({task_type}) failed: {source}")]
    ChainStepFailed {
        step: usize,
        task_type: String,
        #[source]
        source: Box<DispatchError>,
    },

    #[error("All sources failed: {0}")]
    MergeNoSuccess(String),

    #[error("Quorum not met: {succeeded} of {required} required sources succeeded")]
    QuorumNotMet { required: usize, succeeded: usize },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid routing rules: {0}")]
    InvalidRoutingRules(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::JobNotFound(_) => "job_not_found",
            Self::NodeNotFound(_) => "node_not_found",
            Self::NodeUnavailable { .. } => "node_unavailable",
            Self::QueueFull { .. } => "queue_full",
            Self::Call(CallError::Timeout { .. }) => "call_timeout",
            Self::Call(CallError::Cancelled) => "cancelled",
            Self::Call(_) => "call_failed",
            Self::ChainStepFailed { .. } => "chain_step_failed",
            Self::MergeNoSuccess(_) => "merge_no_success",
            Self::QuorumNotMet { .. } => "quorum_not_met",
            Self::Cancelled => "cancelled",
            Self::InvalidRoutingRules(_) => "invalid_routing_rules",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidRoutingRules(_) => StatusCode::BAD_REQUEST,
            Self::JobNotFound(_) | Self::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Self::NodeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Call(CallError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Call(CallError::Cancelled) | Self::Cancelled => StatusCode::CONFLICT,
            Self::Call(_)
            | Self::ChainStepFailed { .. }
            | Self::MergeNoSuccess(_)
            | Self::QuorumNotMet { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Call(CallError::Cancelled))
    }
}

impl From<CallError> for DispatchError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Cancelled => Self::Cancelled,
            other => Self::Call(other),
        }
    }
}

impl From<MergeError> for DispatchError {
    fn from(err: MergeError) -> Self {
        Self::MergeNoSuccess(err.to_string())
    }
}

impl From<QueueFull> for DispatchError {
    fn from(err: QueueFull) -> Self {
        Self::QueueFull {
            capacity: err.capacity,
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NodeNotFound(id) => Self::NodeNotFound(id),
        }
    }
}

impl From<ClassifierError> for DispatchError {
    fn from(err: ClassifierError) -> Self {
        Self::InvalidRoutingRules(err.to_string())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string()
            }
        }));

        (self.status(), body).into_response()
    }
}

/// Last stage a job reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Scheduling,
    Queued,
    Execution,
    ChainStep(usize),
    Merge,
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduling => write!(f, "scheduling"),
            Self::Queued => write!(f, "queued"),
            Self::Execution => write!(f, "execution"),
            Self::ChainStep(step) => write!(f, "chain_step_{}", step),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Terminal job failure with the context needed to retry or investigate.
#[derive(Debug, thiserror::Error)]
#[error("Job {job_id} failed during {stage}: {error}")]
pub struct JobFailure {
    pub job_id: String,
    pub stage: ExecutionStage,
    #[source]
    pub error: DispatchError,
}

impl JobFailure {
    pub fn new(job_id: impl Into<String>, stage: ExecutionStage, error: DispatchError) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            error,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.error.kind().to_string(),
            message: self.error.to_string(),
            job_id: Some(self.job_id.clone()),
            stage: Some(self.stage.to_string()),
        }
    }
}

impl IntoResponse for JobFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        (status, Json(json!({ "error": self.to_body() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let timeout = DispatchError::Call(CallError::Timeout {
            node_id: "gpu-a".to_string(),
            model: "polyglot".to_string(),
            timeout_ms: 100,
        });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.kind(), "call_timeout");

        assert_eq!(
            DispatchError::QueueFull { capacity: 4 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            DispatchError::NodeUnavailable {
                model: "m".to_string(),
                reason: "offline".to_string()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(DispatchError::Cancelled.status(), StatusCode::CONFLICT);
        assert_eq!(
            DispatchError::MergeNoSuccess("x".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_cancelled_call_converts_to_cancelled() {
        let err: DispatchError = CallError::Cancelled.into();
        assert!(matches!(err, DispatchError::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_job_failure_body() {
        let failure = JobFailure::new(
            "job-1",
            ExecutionStage::ChainStep(2),
            DispatchError::QuorumNotMet {
                required: 2,
                succeeded: 1,
            },
        );
        let body = failure.to_body();
        assert_eq!(body.kind, "quorum_not_met");
        assert_eq!(body.job_id.as_deref(), Some("job-1"));
        assert_eq!(body.stage.as_deref(), Some("chain_step_2"));
        assert!(failure.to_string().contains("chain_step_2"));
    }
}
