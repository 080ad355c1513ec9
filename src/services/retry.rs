use std::time::Duration;

use serde_json::Value;

use crate::models::job::Job;
use crate::services::store::Disposition;
use crate::services::worker::HandlerError;

/// Decides what happens to a job after a processing attempt.
///
/// Transient failures are retried with exponential backoff
/// (`base_delay * 2^attempts`, capped at `max_delay`) until `max_attempts`
/// is reached. Permanent failures are dead-lettered immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given attempts already made before this failure.
    pub fn backoff_delay(&self, prior_attempts: u32) -> Duration {
        exponential(self.base_delay, self.max_delay, prior_attempts)
    }

    /// Turn a handler outcome into the transition the store should apply.
    pub fn decide(&self, job: &Job, outcome: Result<Value, HandlerError>) -> Disposition {
        match outcome {
            Ok(result) => Disposition::Complete { result },
            Err(err) if err.is_permanent() => Disposition::Fail {
                error: err.to_string(),
            },
            Err(err) => {
                if job.attempts + 1 < job.max_attempts {
                    Disposition::Retry {
                        error: err.to_string(),
                        delay: self.backoff_delay(job.attempts),
                    }
                } else {
                    Disposition::Fail {
                        error: format!(
                            "Processing failed after {} attempts: {}",
                            job.attempts + 1,
                            err
                        ),
                    }
                }
            }
        }
    }
}

/// Capped exponential backoff used for store reconnection and idle workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, self.max_delay, attempt)
    }
}

fn exponential(base: Duration, cap: Duration, exponent: u32) -> Duration {
    let factor = 2u32.saturating_pow(exponent.min(31));
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobDefaults, JobOptions, Payload};

    fn job_with_attempts(attempts: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(
            "transcode",
            Payload::new(),
            &JobOptions {
                max_attempts: Some(max_attempts),
                ..Default::default()
            },
            &JobDefaults::default(),
        );
        job.attempts = attempts;
        job
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_success_completes() {
        let job = job_with_attempts(0, 3);
        let d = policy().decide(&job, Ok(serde_json::json!({"ok": true})));
        assert_eq!(
            d,
            Disposition::Complete {
                result: serde_json::json!({"ok": true})
            }
        );
    }

    #[test]
    fn test_transient_failure_retries_until_exhausted() {
        let p = policy();
        let err = || Err(HandlerError::Transient("network".into()));

        assert!(matches!(
            p.decide(&job_with_attempts(0, 3), err()),
            Disposition::Retry { delay, .. } if delay == Duration::from_millis(100)
        ));
        assert!(matches!(
            p.decide(&job_with_attempts(1, 3), err()),
            Disposition::Retry { delay, .. } if delay == Duration::from_millis(200)
        ));
        assert!(matches!(
            p.decide(&job_with_attempts(2, 3), err()),
            Disposition::Fail { .. }
        ));
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let d = policy().decide(
            &job_with_attempts(0, 10),
            Err(HandlerError::Permanent("bad payload".into())),
        );
        assert!(matches!(d, Disposition::Fail { error } if error.contains("bad payload")));

        let d = policy().decide(
            &job_with_attempts(0, 10),
            Err(HandlerError::UnregisteredHandler("resize".into())),
        );
        assert!(matches!(d, Disposition::Fail { .. }));
    }

    #[test]
    fn test_reconnect_delay_curve() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(250));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(10), Duration::from_secs(10));
    }
}
