//! Durable job storage with atomic claim/ack primitives.
//!
//! [`JobStore`] is the single source of truth for job state: workers and
//! producers never mutate a [`Job`] directly, every transition goes through one
//! of the atomic operations below. [`MemoryStore`] backs tests and single-process
//! setups, [`RedisStore`] is the production backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::job::{Job, JobCounts, JobId};

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreSettings};

/// Reason recorded on jobs recovered from an expired lease.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Transition applied to an active job by [`JobStore::ack`].
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// `active -> completed`, purged if `remove_on_complete`.
    Complete { result: Value },
    /// `active -> queued`, claimable again after `delay`.
    Retry { error: String, delay: Duration },
    /// `active -> failed` (dead-letter), purged if `remove_on_fail`.
    Fail { error: String },
}

impl Disposition {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Disposition::Complete { .. } => "complete",
            Disposition::Retry { .. } => "retry",
            Disposition::Fail { .. } => "fail",
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Returns only after the write is durable.
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError>;

    /// Take exclusive, time-bounded ownership of the next claimable job.
    ///
    /// Expired leases are recovered first. Waits up to `timeout` for a job and
    /// returns `None` if nothing became available.
    async fn claim(&self, worker_id: &str, timeout: Duration) -> Result<Option<Job>, StoreError>;

    /// Apply `disposition` to a job leased by `worker_id`, incrementing `attempts`.
    ///
    /// Fails with [`StoreError::LeaseLost`] when the lease is no longer held.
    async fn ack(
        &self,
        job_id: JobId,
        worker_id: &str,
        disposition: Disposition,
    ) -> Result<(), StoreError>;

    /// Renew the lease held by `worker_id`, returning the new expiry.
    async fn extend_lease(&self, job_id: JobId, worker_id: &str)
        -> Result<DateTime<Utc>, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Delete a job regardless of status. Returns whether it existed.
    async fn remove(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Delete a job only while it is still `queued`.
    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Dead-lettered jobs, most recently failed first.
    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} has already been claimed")]
    AlreadyClaimed(JobId),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
