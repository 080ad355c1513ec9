use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobOptions, Payload};
use crate::models::transcode::{
    EnqueueResponse, JobStatusResponse, TranscodeRequest, TRANSCODE_JOB,
};
use crate::services::queue::QueueError;

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_FAILED_LISTING: usize = 100;

/// POST /api/transcode-audio: enqueue an audio transcoding job.
pub async fn submit_transcode(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TranscodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request
        .validate()
        .map_err(|report| ApiError::BadRequest(report.to_string()))?;

    let mut payload = Payload::new();
    payload.insert("fileName".into(), request.file_name.clone().into());
    payload.insert("originalUrl".into(), request.original_url.into());
    if let Some(user_id) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        payload.insert("userId".into(), user_id.into());
    }

    let options = JobOptions {
        remove_on_complete: Some(true),
        remove_on_fail: Some(false),
        ..Default::default()
    };
    let job_id = state.queue.enqueue(TRANSCODE_JOB, payload, options).await?;

    tracing::info!(job_id = %job_id, file_name = %request.file_name, "Transcode job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            message: "Audio transcoding job enqueued".to_string(),
            job_id,
        }),
    ))
}

/// GET /api/jobs/{job_id}: job status for polling clients and operators.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.queue.status(job_id).await?;
    Ok(Json(job.into()))
}

/// DELETE /api/jobs/{job_id}: cancel a job that has not been claimed.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.queue.cancel(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<usize>,
}

/// GET /api/jobs/failed: dead-lettered jobs, newest first.
pub async fn list_failed_jobs(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> Result<Json<Vec<JobStatusResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(20).min(MAX_FAILED_LISTING);
    let jobs = state.queue.dead_letters(limit).await?;
    Ok(Json(jobs.into_iter().map(JobStatusResponse::from).collect()))
}

/// Error returned by the job routes.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Queue(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Queue(err) => {
                let status = match &err {
                    QueueError::InvalidJobType | QueueError::InvalidPayload { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    QueueError::NotFound(_) => StatusCode::NOT_FOUND,
                    QueueError::AlreadyClaimed(_) => StatusCode::CONFLICT,
                    QueueError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "Job request failed");
                }
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
