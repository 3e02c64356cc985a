//! Job enqueue, status and log handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use validator::{Validate, ValidationError};

use basejobs_models::{Job, JobId, JobLogLine};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64, message = "type must be 1-64 characters"))]
    pub job_type: String,

    #[serde(default)]
    #[validate(custom(function = "validate_payload"))]
    pub payload: Value,
}

fn validate_payload(payload: &Value) -> Result<(), ValidationError> {
    if payload.is_object() {
        Ok(())
    } else {
        let mut err = ValidationError::new("payload_not_object");
        err.message = Some("payload must be a JSON object".into());
        Err(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogsResponse {
    pub job_id: JobId,
    pub logs: Vec<JobLogLine>,
}

/// Enqueue a job.
///
/// Returns:
/// - 202: `{jobId}`
/// - 400: unknown job type or unparseable body
/// - 422: payload rejected by validation
/// - 503: queue full or backend unavailable
pub async fn enqueue_job(
    State(state): State<AppState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    request
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let job_id = state.queue.enqueue(&request.job_type, request.payload).await?;
    info!(job_id = %job_id, job_type = %request.job_type, "Job enqueued");

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

/// Current record of a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.queue.get_status(&job_id).await?;
    Ok(Json(job))
}

/// Flushed log lines of a job, oldest first.
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobLogsResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let logs = state.queue.get_logs(&job_id).await?;
    Ok(Json(JobLogsResponse { job_id, logs }))
}

/// Malformed ids cannot name a job, so they are reported as not found.
fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    if is_valid_job_id(raw) {
        Ok(JobId::from_string(raw))
    } else {
        Err(ApiError::not_found(format!("Job not found: {}", raw)))
    }
}

/// Valid format: alphanumeric characters and hyphens only, 8-64 chars.
fn is_valid_job_id(id: &str) -> bool {
    if id.len() > 64 || id.len() < 8 {
        return false;
    }
    id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
