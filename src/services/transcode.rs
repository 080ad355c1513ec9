use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use garde::Validate;
use serde_json::Value;

use crate::models::job::Job;
use crate::models::transcode::TranscodePayload;
use crate::services::worker::{HandlerError, JobHandler};

/// Handler for `transcode` jobs.
///
/// The codec itself lives outside this service; the handler validates the
/// payload and stands in for the transcoding run with a fixed delay.
pub struct TranscodeHandler {
    work_duration: Duration,
}

impl TranscodeHandler {
    pub fn new(work_duration: Duration) -> Self {
        Self { work_duration }
    }
}

#[async_trait]
impl JobHandler for TranscodeHandler {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: TranscodePayload = serde_json::from_value(Value::Object(job.payload.clone()))
            .map_err(|e| HandlerError::Permanent(format!("invalid transcode payload: {e}")))?;
        payload
            .validate()
            .map_err(|report| HandlerError::Permanent(format!("invalid transcode payload: {report}")))?;

        tracing::info!(
            job_id = %job.id,
            file_name = %payload.file_name,
            user_id = payload.user_id.as_deref().unwrap_or("anonymous"),
            "Transcoding audio file"
        );
        tokio::time::sleep(self.work_duration).await;
        tracing::info!(job_id = %job.id, file_name = %payload.file_name, "Audio file transcoded");

        Ok(serde_json::json!({
            "fileName": payload.file_name,
            "originalUrl": payload.original_url,
            "transcodedAt": Utc::now(),
        }))
    }
}
