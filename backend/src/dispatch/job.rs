//! Jobs and the store tracking them until their result has been read.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dispatch_common::{
    ChainStepSpec, ErrorBody, ExecutionMode, ExecutionResult, JobStatus, MergeStrategy,
    ProcessRequest, ProcessResponse, SchedulingInfo,
};

use super::classifier::RoutingDecision;
use super::endpoint::CallRequest;
use crate::config::SchedulerConfig;
use crate::error::{DispatchError, JobFailure};

/// A routed request on its way through the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub routing: RoutingDecision,
    /// Requested mode: single, parallel or chain.
    pub mode: ExecutionMode,
    pub priority: u8,
    /// Distinct models requested for a parallel fan-out.
    pub models: Vec<String>,
    pub chain: Vec<ChainStepSpec>,
    pub merge_strategy: MergeStrategy,
    pub timeout: Duration,
    pub detach: bool,
    pub caller: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    estimated_cost: Option<f64>,
    default_cost: f64,
    model_costs: HashMap<String, f64>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl Job {
    pub fn from_request(
        request: ProcessRequest,
        routing: RoutingDecision,
        scheduler: &SchedulerConfig,
        default_timeout: Duration,
    ) -> Result<Self, DispatchError> {
        if request.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("prompt must not be empty".to_string()));
        }
        let params = request.parameters();
        if let Some(cost) = params.estimated_cost {
            if !cost.is_finite() || cost <= 0.0 {
                return Err(DispatchError::InvalidRequest(format!(
                    "estimated_cost must be positive, got {}",
                    cost
                )));
            }
        }
        if params.timeout_ms == Some(0) {
            return Err(DispatchError::InvalidRequest("timeout_ms must be positive".to_string()));
        }

        // Chaining takes precedence over parallel fan-out.
        let mode = if request.requires_chaining {
            ExecutionMode::Chain
        } else if request.requires_parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Single
        };

        let chain = if mode == ExecutionMode::Chain {
            if params.chain.is_empty() {
                vec![ChainStepSpec {
                    task_type: routing.task_type.clone(),
                    model: routing.model.clone(),
                }]
            } else {
                params.chain.clone()
            }
        } else {
            Vec::new()
        };

        let mut models: Vec<String> = Vec::new();
        for model in &params.models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            prompt: request.prompt,
            priority: routing.priority,
            routing,
            mode,
            models,
            chain,
            merge_strategy: params.merge_strategy.unwrap_or_default(),
            timeout: params
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            detach: params.detach,
            caller: request.caller,
            submitted_at: Utc::now(),
            cancel: CancellationToken::new(),
            estimated_cost: params.estimated_cost,
            default_cost: scheduler.default_cost,
            model_costs: scheduler.model_costs.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        })
    }

    /// Capacity one call to `model` is expected to hold.
    pub fn cost_for(&self, model: &str) -> f64 {
        self.estimated_cost
            .or_else(|| self.model_costs.get(model).copied())
            .unwrap_or(self.default_cost)
    }

    /// Capacity for the routed model.
    pub fn cost(&self) -> f64 {
        self.cost_for(&self.routing.model)
    }

    pub fn call_request(&self, prompt: impl Into<String>) -> CallRequest {
        CallRequest {
            prompt: prompt.into(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn response(
        &self,
        status: JobStatus,
        scheduling: SchedulingInfo,
        result: Option<ExecutionResult>,
        error: Option<ErrorBody>,
    ) -> ProcessResponse {
        ProcessResponse {
            job_id: self.id.clone(),
            status,
            routing: self.routing.to_info(),
            execution_mode: scheduling.execution_mode,
            scheduling,
            result,
            error,
        }
    }

    pub fn queued_scheduling() -> SchedulingInfo {
        SchedulingInfo {
            execution_mode: ExecutionMode::Queued,
            nodes: Vec::new(),
        }
    }
}

/// Final outcome delivered to a waiting caller.
#[derive(Debug)]
pub struct JobOutcome {
    pub response: ProcessResponse,
    pub failure: Option<JobFailure>,
}

impl JobOutcome {
    pub fn completed(response: ProcessResponse) -> Self {
        Self {
            response,
            failure: None,
        }
    }

    pub fn failed(
        job: &Job,
        scheduling: SchedulingInfo,
        result: Option<ExecutionResult>,
        failure: JobFailure,
    ) -> Self {
        let status = if failure.error.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        Self {
            response: job.response(status, scheduling, result, Some(failure.to_body())),
            failure: Some(failure),
        }
    }
}

#[derive(Debug)]
struct JobRecord {
    response: ProcessResponse,
    detached: bool,
    cancel: CancellationToken,
}

/// Live jobs by id.
///
/// A waiting caller receives its outcome directly, so its record goes away
/// when the job finishes. A detached job keeps its terminal response until it
/// has been read once.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: &Job) {
        let scheduling = SchedulingInfo {
            execution_mode: job.mode,
            nodes: Vec::new(),
        };
        let record = JobRecord {
            response: job.response(JobStatus::Submitted, scheduling, None, None),
            detached: job.detach,
            cancel: job.cancel.clone(),
        };
        self.jobs.lock().insert(job.id.clone(), record);
    }

    pub fn mark_queued(&self, job_id: &str) {
        self.update(job_id, |response| {
            response.status = JobStatus::Queued;
            response.scheduling = Job::queued_scheduling();
            response.execution_mode = ExecutionMode::Queued;
        });
    }

    pub fn mark_running(&self, job_id: &str, scheduling: SchedulingInfo) {
        self.update(job_id, |response| {
            response.status = JobStatus::Running;
            response.execution_mode = scheduling.execution_mode;
            response.scheduling = scheduling;
        });
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut ProcessResponse)) {
        if let Some(record) = self.jobs.lock().get_mut(job_id) {
            if !record.response.status.is_terminal() {
                f(&mut record.response);
            }
        }
    }

    /// Record the terminal response.
    pub fn finish(&self, response: &ProcessResponse) {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&response.job_id) {
            Some(record) if record.detached => record.response = response.clone(),
            Some(_) => {
                jobs.remove(&response.job_id);
            }
            None => {}
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().get(job_id).map(|r| r.response.status)
    }

    /// Current view of a job. A terminal response is returned once and the
    /// record dropped.
    pub fn read(&self, job_id: &str) -> Option<ProcessResponse> {
        let mut jobs = self.jobs.lock();
        let terminal = jobs.get(job_id)?.response.status.is_terminal();
        if terminal {
            jobs.remove(job_id).map(|r| r.response)
        } else {
            jobs.get(job_id).map(|r| r.response.clone())
        }
    }

    pub fn cancel_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.jobs
            .lock()
            .get(job_id)
            .filter(|r| !r.response.status.is_terminal())
            .map(|r| r.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_common::JobParameters;

    fn routing() -> RoutingDecision {
        RoutingDecision {
            task_type: "multilingual".to_string(),
            model: "polyglot".to_string(),
            priority: 3,
            score: 1,
            fallback: false,
            matched_hints: vec!["translate".to_string()],
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.default_cost = 2.0;
        config.model_costs.insert("polyglot".to_string(), 6.0);
        config
    }

    fn job(request: ProcessRequest) -> Job {
        Job::from_request(request, routing(), &scheduler_config(), Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let err = Job::from_request(
            ProcessRequest::new("   "),
            routing(),
            &scheduler_config(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(job(ProcessRequest::new("x")).mode, ExecutionMode::Single);

        let mut request = ProcessRequest::new("x");
        request.requires_parallel = true;
        assert_eq!(job(request.clone()).mode, ExecutionMode::Parallel);

        request.requires_chaining = true;
        assert_eq!(job(request).mode, ExecutionMode::Chain);
    }

    #[test]
    fn test_chain_defaults_to_routed_step() {
        let mut request = ProcessRequest::new("x");
        request.requires_chaining = true;
        let job = job(request);
        assert_eq!(job.chain.len(), 1);
        assert_eq!(job.chain[0].model, "polyglot");
    }

    #[test]
    fn test_costs() {
        let job = job(ProcessRequest::new("x"));
        assert_eq!(job.cost(), 6.0);
        assert_eq!(job.cost_for("parser-small"), 2.0);

        let mut request = ProcessRequest::new("x");
        request.parameters = Some(JobParameters {
            estimated_cost: Some(1.5),
            timeout_ms: Some(250),
            models: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            ..Default::default()
        });
        let job = self::job(request);
        assert_eq!(job.cost(), 1.5);
        assert_eq!(job.cost_for("parser-small"), 1.5);
        assert_eq!(job.timeout, Duration::from_millis(250));
        assert_eq!(job.models, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_store_detached_result_read_once() {
        let store = JobStore::new();
        let mut request = ProcessRequest::new("x");
        request.parameters = Some(JobParameters {
            detach: true,
            ..Default::default()
        });
        let job = job(request);
        store.insert(&job);
        store.mark_queued(&job.id);
        assert_eq!(store.read(&job.id).unwrap().status, JobStatus::Queued);

        let done = job.response(
            JobStatus::Completed,
            SchedulingInfo {
                execution_mode: ExecutionMode::Single,
                nodes: vec!["gpu-a".to_string()],
            },
            None,
            None,
        );
        store.finish(&done);
        assert_eq!(store.read(&job.id).unwrap().status, JobStatus::Completed);
        assert!(store.read(&job.id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_drops_waited_job_on_finish() {
        let store = JobStore::new();
        let job = job(ProcessRequest::new("x"));
        store.insert(&job);
        store.mark_running(
            &job.id,
            SchedulingInfo {
                execution_mode: ExecutionMode::Single,
                nodes: vec!["gpu-a".to_string()],
            },
        );
        assert_eq!(store.status(&job.id), Some(JobStatus::Running));
        assert!(store.cancel_token(&job.id).is_some());

        store.finish(&job.response(JobStatus::Completed, Job::queued_scheduling(), None, None));
        assert!(store.status(&job.id).is_none());
    }
}
