use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::models::job::{Job, JobCounts, JobDefaults, JobId, JobOptions, Payload};
use crate::services::store::{JobStore, StoreError};

type SchemaCheck = Arc<dyn Fn(&Payload) -> Result<(), String> + Send + Sync>;

/// Producer-facing job queue: enqueue, inspect, cancel.
///
/// Validation happens before anything touches the store, so the only
/// store-related failure a producer sees at submission is
/// [`QueueError::BackendUnavailable`].
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    defaults: JobDefaults,
    schemas: HashMap<String, SchemaCheck>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, defaults: JobDefaults) -> Self {
        Self {
            store,
            defaults,
            schemas: HashMap::new(),
        }
    }

    /// Require payloads of `job_type` to deserialize into `T` and pass its `garde` rules.
    pub fn register_schema<T>(&mut self, job_type: impl Into<String>)
    where
        T: DeserializeOwned + garde::Validate + 'static,
        T::Context: Default,
    {
        let check: SchemaCheck = Arc::new(|payload: &Payload| {
            let typed: T = serde_json::from_value(Value::Object(payload.clone()))
                .map_err(|e| e.to_string())?;
            typed.validate().map_err(|report| report.to_string())
        });
        self.schemas.insert(job_type.into(), check);
    }

    /// Validate and durably enqueue a job, returning its new id.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Payload,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if job_type.trim().is_empty() {
            return Err(QueueError::InvalidJobType);
        }
        if let Some(check) = self.schemas.get(job_type) {
            check(&payload).map_err(|reason| QueueError::InvalidPayload {
                job_type: job_type.to_string(),
                reason,
            })?;
        }

        let job = Job::new(job_type, payload, &options, &self.defaults);
        let job_id = self.store.enqueue(job).await?;

        metrics::counter!("jobs_enqueued_total", "type" => job_type.to_string()).increment(1);
        tracing::info!(job_id = %job_id, job_type = %job_type, "Job added to queue");
        Ok(job_id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    /// Remove a job that no worker has claimed yet.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        self.store.cancel(job_id).await?;
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        Ok(self.store.counts().await?)
    }

    /// Get the current queue depth (jobs waiting to be claimed).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        Ok(self.counts().await?.queued)
    }

    /// Dead-lettered jobs retained for inspection, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.failed_jobs(limit).await?)
    }

    /// Check store connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        Ok(self.store.ping().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job type must not be empty")]
    InvalidJobType,

    #[error("Invalid payload for job type '{job_type}': {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("Job store unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} has already been claimed")]
    AlreadyClaimed(JobId),

    #[error("Job store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => QueueError::BackendUnavailable(reason),
            StoreError::NotFound(id) => QueueError::NotFound(id),
            StoreError::AlreadyClaimed(id) => QueueError::AlreadyClaimed(id),
            other => QueueError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::models::transcode::{TranscodePayload, TRANSCODE_JOB};
    use crate::services::events::EventBus;
    use crate::services::store::MemoryStore;
    use std::time::Duration;

    fn queue() -> (JobQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(EventBus::new(), Duration::from_secs(30)));
        let mut queue = JobQueue::new(store.clone(), JobDefaults::default());
        queue.register_schema::<TranscodePayload>(TRANSCODE_JOB);
        (queue, store)
    }

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_status_is_queued() {
        let (queue, _) = queue();
        let id = queue
            .enqueue(
                TRANSCODE_JOB,
                payload(serde_json::json!({"fileName": "a.mp3", "originalUrl": "http://x/a.mp3"})),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.status(id).await.unwrap();
        assert!(!id.to_string().is_empty());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_rejects_empty_type_and_bad_payload() {
        let (queue, store) = queue();
        assert!(matches!(
            queue.enqueue("  ", Payload::new(), JobOptions::default()).await,
            Err(QueueError::InvalidJobType)
        ));
        assert!(matches!(
            queue
                .enqueue(
                    TRANSCODE_JOB,
                    payload(serde_json::json!({"fileName": "a.mp3"})),
                    JobOptions::default()
                )
                .await,
            Err(QueueError::InvalidPayload { .. })
        ));
        assert_eq!(store.counts().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_types_without_schema_accept_any_payload() {
        let (queue, _) = queue();
        assert!(queue
            .enqueue("cleanup", Payload::new(), JobOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store_maps_to_backend_unavailable() {
        let (queue, store) = queue();
        store.set_connected(false);
        let err = queue
            .enqueue("cleanup", Payload::new(), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::BackendUnavailable(_)));

        store.set_connected(true);
        assert_eq!(queue.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_of_unknown_job_is_not_found() {
        let (queue, _) = queue();
        let id = uuid::Uuid::new_v4();
        assert!(matches!(queue.status(id).await, Err(QueueError::NotFound(missing)) if missing == id));
    }
}
