//! Job submission, dry-run classification and job tracking.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use dispatch_common::{ClassifyResponse, ProcessRequest, ProcessResponse};

use crate::dispatch::job::{Job, JobOutcome};
use crate::dispatch::scheduler::Submission;
use crate::error::DispatchError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub cancelled: bool,
}

/// POST /process - Classify, schedule and run a request
async fn process(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> Result<Response, DispatchError> {
    let routing = state.classifier.route(&request);
    let job = Job::from_request(
        request,
        routing,
        &state.config.scheduler,
        state.gateway.default_timeout(),
    )?;

    let outcome = match state.scheduler.submit(job).await {
        Submission::Finished(outcome) => outcome,
        Submission::Accepted(response) => {
            return Ok((StatusCode::ACCEPTED, Json(response)).into_response());
        }
        Submission::Pending { job_id, receiver } => receiver.await.map_err(|_| {
            DispatchError::Internal(format!("job {} was dropped before it finished", job_id))
        })?,
    };

    Ok(outcome_response(outcome))
}

fn outcome_response(outcome: JobOutcome) -> Response {
    let status = outcome
        .failure
        .as_ref()
        .map(|f| f.error.status())
        .unwrap_or(StatusCode::OK);
    (status, Json(outcome.response)).into_response()
}

/// POST /classify - Routing decision only, nothing is scheduled
async fn classify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> Json<ClassifyResponse> {
    Json(state.classifier.route(&request).to_classify_response())
}

/// GET /jobs/:id - Status of a tracked job
///
/// A finished job's result is handed out once; afterwards the job is unknown.
async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<ProcessResponse>, DispatchError> {
    state
        .jobs
        .read(&job_id)
        .map(Json)
        .ok_or(DispatchError::JobNotFound(job_id))
}

/// POST /jobs/:id/cancel - Cancel a queued or running job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), DispatchError> {
    state.scheduler.cancel(&job_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id,
            cancelled: true,
        }),
    ))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process", post(process))
        .route("/classify", post(classify))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}
