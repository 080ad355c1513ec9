use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier assigned to a job at enqueue time. Never reused.
pub type JobId = Uuid;

/// Opaque job payload (e.g. `fileName`, `originalUrl`, `userId`).
pub type Payload = serde_json::Map<String, Value>;

/// Lifecycle status of a job in the queue.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-job overrides supplied by the producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub max_attempts: Option<u32>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
}

/// Queue-wide defaults applied when `JobOptions` leaves a field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// A unit of deferred work and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Payload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    /// Earliest time a queued job may be claimed (pushed forward by retry backoff).
    pub run_at: DateTime<Utc>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `queued` job with a new identifier.
    pub fn new(
        job_type: impl Into<String>,
        payload: Payload,
        options: &JobOptions,
        defaults: &JobDefaults,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            lease_expiry: None,
            leased_by: None,
            run_at: now,
            remove_on_complete: options
                .remove_on_complete
                .unwrap_or(defaults.remove_on_complete),
            remove_on_fail: options.remove_on_fail.unwrap_or(defaults.remove_on_fail),
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once `attempts` has reached the ceiling.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Number of jobs in each status, as reported by the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_new_job_applies_defaults() {
        let job = Job::new(
            "transcode",
            Payload::new(),
            &JobOptions::default(),
            &JobDefaults::default(),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(!job.remove_on_complete);
        assert!(!job.remove_on_fail);
        assert!(job.lease_expiry.is_none());
    }

    #[test]
    fn test_options_override_defaults() {
        let options = JobOptions {
            max_attempts: Some(5),
            remove_on_complete: Some(true),
            remove_on_fail: None,
        };
        let job = Job::new("transcode", Payload::new(), &options, &JobDefaults::default());
        assert_eq!(job.max_attempts, 5);
        assert!(job.remove_on_complete);
        assert!(!job.remove_on_fail);
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let options = JobOptions {
            max_attempts: Some(0),
            ..Default::default()
        };
        let job = Job::new("transcode", Payload::new(), &options, &JobDefaults::default());
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Queued.to_string(), "queued");
        assert_eq!(JobStatus::from_str("failed").unwrap(), JobStatus::Failed);
        assert_eq!(
            serde_json::to_value(JobStatus::Active).unwrap(),
            serde_json::json!("active")
        );
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_job_wire_format_uses_type_key() {
        let job = Job::new(
            "transcode",
            Payload::new(),
            &JobOptions::default(),
            &JobDefaults::default(),
        );
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "transcode");
        assert_eq!(value["maxAttempts"], 3);
        assert_eq!(value["removeOnComplete"], false);
    }
}
