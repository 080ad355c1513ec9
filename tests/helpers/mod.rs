//! Test helper utilities for queue and worker tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use transcode_queue::{
    models::{
        event::QueueEvent,
        job::{Job, JobDefaults, JobId, JobStatus, Payload},
        transcode::{TranscodePayload, TRANSCODE_JOB},
    },
    services::{
        events::EventBus,
        queue::JobQueue,
        retry::{ReconnectPolicy, RetryPolicy},
        store::{JobStore, MemoryStore},
        worker::{WorkerPool, WorkerSettings},
    },
};

/// Everything a test needs, wired to one in-memory store.
pub struct Harness {
    pub events: EventBus,
    pub store: Arc<MemoryStore>,
    pub queue: JobQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(5))
    }

    pub fn with_lease(lease: Duration) -> Self {
        let events = EventBus::new();
        let store = Arc::new(MemoryStore::new(events.clone(), lease));
        let mut queue = JobQueue::new(store.clone(), JobDefaults::default());
        queue.register_schema::<TranscodePayload>(TRANSCODE_JOB);
        Self {
            events,
            store,
            queue,
        }
    }

    /// Worker pool with millisecond-scale timings.
    pub fn pool(&self, lease: Duration) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            fast_retry(),
            fast_settings("test", lease),
            self.events.clone(),
        )
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20))
}

pub fn fast_settings(name: &str, lease: Duration) -> WorkerSettings {
    WorkerSettings {
        name: name.to_string(),
        claim_timeout: Duration::from_millis(50),
        lease_duration: lease,
        idle_backoff: ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    }
}

/// Payload for a `transcode` job.
pub fn transcode_payload(file_name: &str) -> Payload {
    object(json!({
        "fileName": file_name,
        "originalUrl": format!("https://cdn.example.com/uploads/{file_name}"),
        "userId": "user-1",
    }))
}

pub fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Poll the store until the job reaches `status` (with timeout).
pub async fn wait_for_status(
    store: &dyn JobStore,
    job_id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(job)) = store.get(job_id).await {
            if job.status == status {
                return job;
            }
        }
        assert!(
            Instant::now() < deadline,
            "Job {job_id} did not reach {status} within {timeout:?}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the store until the job record is gone (with timeout).
pub async fn wait_for_removal(store: &dyn JobStore, job_id: JobId, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while let Ok(Some(_)) = store.get(job_id).await {
        assert!(
            Instant::now() < deadline,
            "Job {job_id} was not removed within {timeout:?}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one matches `predicate` (with timeout).
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<QueueEvent>,
    timeout: Duration,
    mut predicate: F,
) -> QueueEvent
where
    F: FnMut(&QueueEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => panic!("No matching event within {timeout:?}"),
        }
    }
}
