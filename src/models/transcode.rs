use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobId;

/// Job type tag for audio transcoding work.
pub const TRANSCODE_JOB: &str = "transcode";

/// Request body for `POST /api/transcode-audio`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeRequest {
    #[garde(length(min = 1, max = 512))]
    pub file_name: String,

    #[garde(url)]
    pub original_url: String,
}

/// Payload stored on a `transcode` job. Also the schema the queue validates against.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TranscodePayload {
    #[garde(length(min = 1, max = 512))]
    pub file_name: String,

    #[garde(url)]
    pub original_url: String,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Response after a transcode job is accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub message: String,
    pub job_id: JobId,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<crate::models::job::Job> for JobStatusResponse {
    fn from(job: crate::models::job::Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status.to_string(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            result: job.result,
        }
    }
}
