//! Scheduler: turns routed jobs into execution plans and drives them.
//!
//! A plan holds capacity reservations for the nodes it will use. A job that
//! cannot get the capacity it needs goes to the [`JobQueue`] and is retried
//! by [`Scheduler::try_dispatch`] whenever capacity frees up.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use dispatch_common::{
    ChainStepOutput, ExecutionMode, ExecutionResult, JobStatus, ProcessResponse, SchedulingInfo,
};

use super::endpoint::{CallOutput, CallRequest, CallResult, EndpointGateway, ModelEndpoint};
use super::job::{Job, JobOutcome, JobStore};
use super::merger::{self, MergeInput, Synthesizer};
use super::queue::{JobQueue, QueueEntry};
use super::registry::{NodeRegistry, Reservation};
use crate::config::SchedulerConfig;
use crate::error::{DispatchError, ExecutionStage, JobFailure};

/// A reserved slot for one model call.
#[derive(Debug)]
pub struct Assignment {
    pub endpoint: ModelEndpoint,
    pub reservation: Reservation,
}

/// How a job will run, with its capacity already reserved.
#[derive(Debug)]
pub enum ExecutionPlan {
    Single(Assignment),
    Parallel {
        assignments: Vec<Assignment>,
        /// Successful sources needed before merging.
        quorum: usize,
    },
    /// Only the first step is reserved up front.
    Chain(Assignment),
}

impl ExecutionPlan {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Single(_) => ExecutionMode::Single,
            Self::Parallel { .. } => ExecutionMode::Parallel,
            Self::Chain(_) => ExecutionMode::Chain,
        }
    }

    pub fn nodes(&self) -> Vec<String> {
        match self {
            Self::Single(a) | Self::Chain(a) => vec![a.endpoint.node_id.clone()],
            Self::Parallel { assignments, .. } => assignments
                .iter()
                .map(|a| a.endpoint.node_id.clone())
                .collect(),
        }
    }

    pub fn scheduling_info(&self) -> SchedulingInfo {
        SchedulingInfo {
            execution_mode: self.mode(),
            nodes: self.nodes(),
        }
    }
}

/// Result of handing a job to the scheduler.
#[derive(Debug)]
pub enum Submission {
    /// The job ran (or was rejected) and this is its outcome.
    Finished(JobOutcome),
    /// Detached job accepted; its outcome is read later through the job store.
    Accepted(ProcessResponse),
    /// The job is queued; the outcome arrives on `receiver`.
    Pending {
        job_id: String,
        receiver: oneshot::Receiver<JobOutcome>,
    },
}

struct RunOutcome {
    nodes: Vec<String>,
    result: Option<ExecutionResult>,
    failure: Option<JobFailure>,
}

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    gateway: Arc<EndpointGateway>,
    queue: Arc<JobQueue>,
    jobs: Arc<JobStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        gateway: Arc<EndpointGateway>,
        queue: Arc<JobQueue>,
        jobs: Arc<JobStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            queue,
            jobs,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// Reserve capacity for `job`, or `None` if it has to wait.
    ///
    /// A parallel job that cannot reach its quorum holds nothing: tentative
    /// reservations are rolled back.
    pub fn schedule(&self, job: &Job) -> Option<ExecutionPlan> {
        match job.mode {
            ExecutionMode::Chain => {
                let first = job.chain.first()?;
                self.reserve_endpoint(&first.model, job.cost_for(&first.model), &[])
                    .map(ExecutionPlan::Chain)
            }
            ExecutionMode::Parallel => {
                let targets = self.parallel_targets(job);
                let quorum = self.quorum_for(targets.len());
                let mut assignments: Vec<Assignment> = Vec::with_capacity(targets.len());
                for model in &targets {
                    let taken: Vec<String> = assignments
                        .iter()
                        .map(|a| a.endpoint.node_id.clone())
                        .collect();
                    if let Some(assignment) =
                        self.reserve_endpoint(model, job.cost_for(model), &taken)
                    {
                        assignments.push(assignment);
                    }
                }
                if assignments.len() < quorum {
                    tracing::debug!(
                        job_id = %job.id,
                        reserved = assignments.len(),
                        quorum,
                        "parallel quorum unavailable, rolling back"
                    );
                    for assignment in assignments {
                        assignment.reservation.rollback();
                    }
                    return None;
                }
                Some(ExecutionPlan::Parallel { assignments, quorum })
            }
            ExecutionMode::Single | ExecutionMode::Queued => self
                .reserve_endpoint(&job.routing.model, job.cost(), &[])
                .map(ExecutionPlan::Single),
        }
    }

    /// Run `job` now if capacity allows, otherwise queue it.
    pub async fn submit(self: &Arc<Self>, job: Job) -> Submission {
        self.jobs.insert(&job);
        tracing::info!(
            job_id = %job.id,
            task_type = %job.routing.task_type,
            model = %job.routing.model,
            mode = %job.mode,
            priority = job.priority,
            caller = job.caller.as_deref().unwrap_or("-"),
            "job submitted"
        );

        if let Err(err) = self.check_hostable(&job) {
            let scheduling = SchedulingInfo {
                execution_mode: job.mode,
                nodes: Vec::new(),
            };
            let failure = JobFailure::new(&job.id, ExecutionStage::Scheduling, err);
            return Submission::Finished(self.finish(&job, scheduling, None, Some(failure)));
        }

        // Waiting jobs get the first claim on free capacity.
        if !self.queue.is_empty() {
            self.try_dispatch();
        }

        if let Some(plan) = self.schedule(&job) {
            self.begin(&job, &plan);
            if job.detach {
                let accepted = job.response(JobStatus::Running, plan.scheduling_info(), None, None);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.run_plan(job, plan).await;
                });
                return Submission::Accepted(accepted);
            }
            return Submission::Finished(self.run_attached(job, plan).await);
        }

        // Mark before enqueueing so the dispatcher cannot start it first.
        self.jobs.mark_queued(&job.id);
        let queued = job.response(JobStatus::Queued, Job::queued_scheduling(), None, None);
        let job_id = job.id.clone();
        let (responder, receiver) = if job.detach {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };

        match self.queue.enqueue(job, responder) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, depth = self.queue.len(), "no capacity, job queued");
                match receiver {
                    Some(receiver) => Submission::Pending { job_id, receiver },
                    None => Submission::Accepted(queued),
                }
            }
            Err(full) => {
                let job = *full.job;
                tracing::warn!(job_id = %job.id, capacity = full.capacity, "queue full, rejecting job");
                let failure = JobFailure::new(
                    &job.id,
                    ExecutionStage::Scheduling,
                    DispatchError::QueueFull {
                        capacity: full.capacity,
                    },
                );
                Submission::Finished(self.finish(&job, Job::queued_scheduling(), None, Some(failure)))
            }
        }
    }

    /// Retry every queued job in priority order. Jobs that still cannot be
    /// scheduled go back with their original position.
    ///
    /// Returns the number of jobs started.
    pub fn try_dispatch(self: &Arc<Self>) -> usize {
        let entries = self.queue.drain();
        if entries.is_empty() {
            return 0;
        }

        let mut started = 0;
        for entry in entries {
            if entry.job.cancel.is_cancelled() {
                self.finish_cancelled(entry);
                continue;
            }
            match self.schedule(&entry.job) {
                Some(plan) => {
                    started += 1;
                    let QueueEntry {
                        job,
                        responder,
                        enqueued_at,
                        ..
                    } = entry;
                    tracing::debug!(
                        job_id = %job.id,
                        waited_ms = enqueued_at.elapsed().as_millis() as u64,
                        "dispatching queued job"
                    );
                    self.begin(&job, &plan);
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = this.run_plan(job, plan).await;
                        if let Some(tx) = responder {
                            let _ = tx.send(outcome);
                        }
                    });
                }
                None => self.queue.requeue(entry),
            }
        }
        started
    }

    /// Cancel a live job. Queued jobs leave the queue; running jobs abort
    /// their in-flight calls and release their capacity.
    pub fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        let token = self
            .jobs
            .cancel_token(job_id)
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))?;
        token.cancel();
        tracing::info!(job_id, "job cancellation requested");

        if let Some(entry) = self.queue.remove(job_id) {
            self.finish_cancelled(entry);
        }
        Ok(())
    }

    fn finish_cancelled(&self, entry: QueueEntry) {
        let failure = JobFailure::new(&entry.job.id, ExecutionStage::Queued, DispatchError::Cancelled);
        let outcome = self.finish(&entry.job, Job::queued_scheduling(), None, Some(failure));
        entry.respond(outcome);
    }

    fn quorum_for(&self, targets: usize) -> usize {
        self.config.quorum.min(targets).max(1)
    }

    /// Models to fan out to: the requested models, or the routed model once
    /// per parallel slot.
    fn parallel_targets(&self, job: &Job) -> Vec<String> {
        if job.models.is_empty() {
            vec![job.routing.model.clone(); self.config.max_parallel]
        } else {
            job.models
                .iter()
                .take(self.config.max_parallel)
                .cloned()
                .collect()
        }
    }

    /// Fail fast on jobs no node could ever run.
    fn check_hostable(&self, job: &Job) -> Result<(), DispatchError> {
        let unavailable = |model: &str| DispatchError::NodeUnavailable {
            model: model.to_string(),
            reason: format!(
                "no configured node hosts it with {} capacity units",
                job.cost_for(model)
            ),
        };
        match job.mode {
            ExecutionMode::Chain => {
                for step in &job.chain {
                    if !self.registry.could_host(&step.model, job.cost_for(&step.model)) {
                        return Err(unavailable(&step.model));
                    }
                }
                Ok(())
            }
            ExecutionMode::Parallel => {
                let targets = self.parallel_targets(job);
                let quorum = self.quorum_for(targets.len());
                // Every assignment lands on a distinct node.
                let demands: Vec<(String, f64)> = targets
                    .iter()
                    .map(|m| (m.clone(), job.cost_for(m)))
                    .collect();
                let hosts = self.registry.count_hosts(&demands);
                if hosts >= quorum {
                    return Ok(());
                }
                let model = targets
                    .iter()
                    .find(|m| !self.registry.could_host(m, job.cost_for(m)))
                    .unwrap_or(&job.routing.model);
                Err(DispatchError::NodeUnavailable {
                    model: model.clone(),
                    reason: format!(
                        "quorum of {} needs distinct nodes but only {} could host the fan-out",
                        quorum, hosts
                    ),
                })
            }
            ExecutionMode::Single | ExecutionMode::Queued => {
                if self.registry.could_host(&job.routing.model, job.cost()) {
                    Ok(())
                } else {
                    Err(unavailable(&job.routing.model))
                }
            }
        }
    }

    /// Reserve `cost` units on the best node serving `model`, skipping
    /// `exclude` and endpoints in cool-down.
    fn reserve_endpoint(&self, model: &str, cost: f64, exclude: &[String]) -> Option<Assignment> {
        for node in self.registry.candidates(model, cost) {
            if exclude.contains(&node.id) || !self.gateway.is_available(&node.id, model) {
                continue;
            }
            let Some(endpoint) = self.gateway.endpoint(&node.id, model) else {
                continue;
            };
            if let Some(reservation) = self.registry.try_reserve(&node.id, cost) {
                return Some(Assignment {
                    endpoint,
                    reservation,
                });
            }
        }
        None
    }

    /// Reserve capacity for a later chain step, waiting for releases until
    /// the job's timeout.
    async fn wait_for_capacity(&self, job: &Job, model: &str) -> Result<Assignment, DispatchError> {
        let cost = job.cost_for(model);
        let deadline = tokio::time::Instant::now() + job.timeout;
        let mut events = self.registry.capacity_events();
        loop {
            let _ = events.borrow_and_update();
            if let Some(assignment) = self.reserve_endpoint(model, cost, &[]) {
                return Ok(assignment);
            }
            tokio::select! {
                _ = job.cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(DispatchError::NodeUnavailable {
                        model: model.to_string(),
                        reason: format!("no capacity within {}ms", job.timeout.as_millis()),
                    });
                }
                changed = events.changed() => {
                    if changed.is_err() {
                        return Err(DispatchError::Internal("node registry closed".to_string()));
                    }
                }
                _ = tokio::time::sleep(self.config.dispatch_interval()) => {}
            }
        }
    }

    /// Call the assigned endpoint; on a retryable failure, try once more on
    /// the next-best node. Every reservation is released before returning.
    async fn invoke_with_retry(
        &self,
        job: &Job,
        assignment: Assignment,
        request: &CallRequest,
    ) -> Result<(CallOutput, String), DispatchError> {
        let Assignment {
            endpoint,
            reservation,
        } = assignment;
        let first = self
            .gateway
            .invoke(&endpoint, request, job.timeout, &job.cancel)
            .await;
        reservation.release();

        let err = match first {
            Ok(output) => {
                tracing::debug!(
                    job_id = %job.id,
                    node_id = %endpoint.node_id,
                    latency_ms = output.latency.as_millis() as u64,
                    "model call completed"
                );
                return Ok((output, endpoint.node_id));
            }
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err.into()),
        };

        let cost = job.cost_for(&endpoint.model);
        let Some(alternate) = self.reserve_endpoint(&endpoint.model, cost, &[endpoint.node_id.clone()])
        else {
            return Err(DispatchError::NodeUnavailable {
                model: endpoint.model.clone(),
                reason: format!("{}; no alternate node available", err),
            });
        };

        tracing::info!(
            job_id = %job.id,
            model = %endpoint.model,
            failed_node = %endpoint.node_id,
            node_id = %alternate.endpoint.node_id,
            "retrying on alternate node"
        );
        let Assignment {
            endpoint,
            reservation,
        } = alternate;
        let second = self
            .gateway
            .invoke(&endpoint, request, job.timeout, &job.cancel)
            .await;
        reservation.release();
        second
            .map(|output| (output, endpoint.node_id))
            .map_err(DispatchError::from)
    }

    fn begin(&self, job: &Job, plan: &ExecutionPlan) {
        let scheduling = plan.scheduling_info();
        tracing::info!(
            job_id = %job.id,
            mode = %scheduling.execution_mode,
            nodes = ?scheduling.nodes,
            "job running"
        );
        self.jobs.mark_running(&job.id, scheduling);
    }

    /// Run a plan for a caller that waits on it.
    ///
    /// The run is its own task and always reaches a terminal state. Dropping
    /// the caller cancels the job.
    async fn run_attached(self: &Arc<Self>, job: Job, plan: ExecutionPlan) -> JobOutcome {
        let on_drop = job.cancel.clone().drop_guard();
        let scheduling = plan.scheduling_info();
        let record = job.clone();
        let this = Arc::clone(self);
        let joined = tokio::spawn(async move { this.run_plan(job, plan).await }).await;
        let _ = on_drop.disarm();

        match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(job_id = %record.id, error = %err, "job task aborted");
                let failure = JobFailure::new(
                    &record.id,
                    ExecutionStage::Execution,
                    DispatchError::Internal(format!("job task aborted: {}", err)),
                );
                self.finish(&record, scheduling, None, Some(failure))
            }
        }
    }

    async fn run_plan(&self, job: Job, plan: ExecutionPlan) -> JobOutcome {
        let started = Instant::now();
        let mode = plan.mode();
        let run = match plan {
            ExecutionPlan::Single(assignment) => self.run_single(&job, assignment).await,
            ExecutionPlan::Parallel {
                assignments,
                quorum,
            } => self.run_parallel(&job, assignments, quorum).await,
            ExecutionPlan::Chain(first) => self.run_chain(&job, first).await,
        };

        let scheduling = SchedulingInfo {
            execution_mode: mode,
            nodes: run.nodes,
        };
        let result = run.result.map(|mut result| {
            result.latency_ms = started.elapsed().as_millis() as u64;
            result
        });
        self.finish(&job, scheduling, result, run.failure)
    }

    /// Record the terminal state and build the caller's outcome.
    fn finish(
        &self,
        job: &Job,
        scheduling: SchedulingInfo,
        result: Option<ExecutionResult>,
        failure: Option<JobFailure>,
    ) -> JobOutcome {
        let total_ms = (Utc::now() - job.submitted_at).num_milliseconds().max(0);
        let outcome = match failure {
            None => {
                tracing::info!(
                    job_id = %job.id,
                    mode = %scheduling.execution_mode,
                    total_ms,
                    "job completed"
                );
                JobOutcome::completed(job.response(JobStatus::Completed, scheduling, result, None))
            }
            Some(failure) => {
                tracing::warn!(
                    job_id = %job.id,
                    stage = %failure.stage,
                    error = %failure.error,
                    total_ms,
                    "job failed"
                );
                JobOutcome::failed(job, scheduling, result, failure)
            }
        };
        self.jobs.finish(&outcome.response);
        outcome
    }

    async fn run_single(&self, job: &Job, assignment: Assignment) -> RunOutcome {
        let node_id = assignment.endpoint.node_id.clone();
        let request = job.call_request(job.prompt.as_str());
        match self.invoke_with_retry(job, assignment, &request).await {
            Ok((output, node_id)) => RunOutcome {
                nodes: vec![node_id],
                result: Some(ExecutionResult {
                    output: Some(output.content),
                    merge: None,
                    chain: Vec::new(),
                    failed: false,
                    latency_ms: 0,
                }),
                failure: None,
            },
            Err(err) => RunOutcome {
                nodes: vec![node_id],
                result: None,
                failure: Some(JobFailure::new(&job.id, ExecutionStage::Execution, err)),
            },
        }
    }

    async fn run_parallel(&self, job: &Job, assignments: Vec<Assignment>, quorum: usize) -> RunOutcome {
        let mut nodes: Vec<String> = assignments
            .iter()
            .map(|a| a.endpoint.node_id.clone())
            .collect();
        let mut calls = Vec::with_capacity(assignments.len());
        let mut reservations = Vec::with_capacity(assignments.len());
        for Assignment {
            endpoint,
            reservation,
        } in assignments
        {
            calls.push((endpoint, job.call_request(job.prompt.as_str())));
            reservations.push(reservation);
        }

        let mut results = self.gateway.invoke_many(calls, job.timeout, &job.cancel).await;
        for reservation in reservations {
            reservation.release();
        }
        if !job.cancel.is_cancelled() {
            results = self.retry_failed_sources(job, results, &mut nodes).await;
        }

        let fail = |stage, err| RunOutcome {
            nodes: nodes.clone(),
            result: None,
            failure: Some(JobFailure::new(&job.id, stage, err)),
        };

        if job.cancel.is_cancelled() {
            return fail(ExecutionStage::Execution, DispatchError::Cancelled);
        }

        let inputs: Vec<MergeInput> = results.into_iter().map(MergeInput::from).collect();
        let succeeded = inputs.iter().filter(|i| i.payload.is_some()).count();
        if succeeded > 0 && succeeded < quorum {
            return fail(
                ExecutionStage::Merge,
                DispatchError::QuorumNotMet {
                    required: quorum,
                    succeeded,
                },
            );
        }

        let synthesizer = self.config.synthesis_model.as_ref().map(|model| NodeSynthesizer {
            scheduler: self,
            job,
            model: model.clone(),
        });
        let merged = merger::merge(
            &inputs,
            job.merge_strategy,
            synthesizer.as_ref().map(|s| s as &dyn Synthesizer),
        )
        .await;

        match merged {
            Ok(output) => RunOutcome {
                nodes: nodes.clone(),
                result: Some(ExecutionResult {
                    merge: Some(output.summary()),
                    output: Some(output.payload),
                    chain: Vec::new(),
                    failed: false,
                    latency_ms: 0,
                }),
                failure: None,
            },
            Err(err) => fail(ExecutionStage::Merge, err.into()),
        }
    }

    /// Give each retryable fan-out failure one more try on a node the job has
    /// not used yet. Failures with no free alternate are kept as they are.
    async fn retry_failed_sources(
        &self,
        job: &Job,
        results: Vec<CallResult>,
        nodes: &mut Vec<String>,
    ) -> Vec<CallResult> {
        let mut kept = Vec::with_capacity(results.len());
        let mut calls = Vec::new();
        let mut reservations = Vec::new();
        for result in results {
            let retryable = matches!(&result.outcome, Err(err) if err.is_retryable());
            if !retryable {
                kept.push(result);
                continue;
            }
            let model = &result.endpoint.model;
            match self.reserve_endpoint(model, job.cost_for(model), nodes.as_slice()) {
                Some(Assignment {
                    endpoint,
                    reservation,
                }) => {
                    tracing::info!(
                        job_id = %job.id,
                        model = %model,
                        failed_node = %result.endpoint.node_id,
                        node_id = %endpoint.node_id,
                        "retrying fan-out source on alternate node"
                    );
                    nodes.push(endpoint.node_id.clone());
                    calls.push((endpoint, job.call_request(job.prompt.as_str())));
                    reservations.push(reservation);
                }
                None => kept.push(result),
            }
        }
        if calls.is_empty() {
            return kept;
        }

        let retried = self.gateway.invoke_many(calls, job.timeout, &job.cancel).await;
        for reservation in reservations {
            reservation.release();
        }
        kept.extend(retried);
        kept
    }

    async fn run_chain(&self, job: &Job, first: Assignment) -> RunOutcome {
        let mut nodes = Vec::with_capacity(job.chain.len());
        let mut completed: Vec<ChainStepOutput> = Vec::with_capacity(job.chain.len());
        let mut next = Some(first);

        for (index, step) in job.chain.iter().enumerate() {
            let number = index + 1;
            let stage = ExecutionStage::ChainStep(number);

            let outcome = match next.take() {
                Some(assignment) => Ok(assignment),
                None => self.wait_for_capacity(job, &step.model).await,
            };
            let outcome = match outcome {
                Ok(assignment) => {
                    nodes.push(assignment.endpoint.node_id.clone());
                    let prompt = match completed.last() {
                        Some(previous) => fold_previous_output(&job.prompt, previous),
                        None => job.prompt.clone(),
                    };
                    let request = job.call_request(prompt);
                    self.invoke_with_retry(job, assignment, &request).await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok((output, node_id)) => {
                    if let Some(last) = nodes.last_mut() {
                        *last = node_id.clone();
                    }
                    tracing::debug!(job_id = %job.id, step = number, node_id = %node_id, "chain step completed");
                    completed.push(ChainStepOutput {
                        step: number,
                        task_type: step.task_type.clone(),
                        model: step.model.clone(),
                        node_id,
                        output: output.content,
                    });
                }
                Err(err) => {
                    let error = if err.is_cancelled() {
                        err
                    } else {
                        DispatchError::ChainStepFailed {
                            step: number,
                            task_type: step.task_type.clone(),
                            source: Box::new(err),
                        }
                    };
                    return RunOutcome {
                        nodes,
                        result: Some(ExecutionResult {
                            output: completed.last().map(|s| s.output.clone()),
                            merge: None,
                            chain: completed,
                            failed: true,
                            latency_ms: 0,
                        }),
                        failure: Some(JobFailure::new(&job.id, stage, error)),
                    };
                }
            }
        }

        RunOutcome {
            nodes,
            result: Some(ExecutionResult {
                output: completed.last().map(|s| s.output.clone()),
                merge: None,
                chain: completed,
                failed: false,
                latency_ms: 0,
            }),
            failure: None,
        }
    }
}

/// Input for the step after `previous`.
fn fold_previous_output(prompt: &str, previous: &ChainStepOutput) -> String {
    format!(
        "{}\n\nOutput of step {} ({}):\n{}",
        prompt, previous.step, previous.task_type, previous.output
    )
}

/// Ensemble synthesis through the configured synthesis model.
struct NodeSynthesizer<'a> {
    scheduler: &'a Scheduler,
    job: &'a Job,
    model: String,
}

#[async_trait]
impl<'a> Synthesizer for NodeSynthesizer<'a> {
    async fn synthesize(&self, combined: &str) -> Result<String, String> {
        let cost = self.job.cost_for(&self.model);
        let assignment = self
            .scheduler
            .reserve_endpoint(&self.model, cost, &[])
            .ok_or_else(|| format!("no capacity for synthesis model '{}'", self.model))?;

        let prompt = format!(
            "Combine these independent analyses into a single answer.\n\nRequest:\n{}\n\nAnalyses:\n{}",
            self.job.prompt, combined
        );
        let result = self
            .scheduler
            .gateway
            .invoke(
                &assignment.endpoint,
                &self.job.call_request(prompt),
                self.job.timeout,
                &self.job.cancel,
            )
            .await;
        assignment.reservation.release();
        result.map(|output| output.content).map_err(|e| e.to_string())
    }
}
