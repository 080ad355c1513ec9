use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Disposition, JobStore, StoreError, LEASE_EXPIRED};
use crate::models::event::QueueEvent;
use crate::models::job::{Job, JobCounts, JobId, JobStatus};
use crate::services::events::EventBus;

/// In-process job store.
///
/// Every primitive runs inside one critical section over the job map, which
/// gives the same atomicity the Redis scripts provide. Blocked claimers are
/// woken through a [`Notify`] whenever a job becomes claimable.
pub struct MemoryStore {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
    lease_duration: Duration,
    events: EventBus,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
}

impl MemoryStore {
    pub fn new(events: EventBus, lease_duration: Duration) -> Self {
        events.emit(QueueEvent::StoreConnecting);
        events.emit(QueueEvent::StoreReady);
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            connected: AtomicBool::new(true),
            lease_duration,
            events,
        }
    }

    /// Simulate losing or regaining the backend connection.
    ///
    /// While disconnected every operation fails with [`StoreError::Unavailable`];
    /// stored jobs are kept and become claimable again on reconnect.
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        match (was, connected) {
            (true, false) => self.events.emit(QueueEvent::StoreDisconnected {
                reason: "connection closed".to_string(),
            }),
            (false, true) => {
                self.events.emit(QueueEvent::StoreReconnecting { attempt: 1 });
                self.events.emit(QueueEvent::StoreReady);
                self.notify.notify_waiters();
            }
            _ => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection closed".to_string()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_dead_letters(&self, dead: Vec<JobId>) {
        for job_id in dead {
            self.events.emit(QueueEvent::JobFailed {
                job_id,
                reason: LEASE_EXPIRED.to_string(),
            });
        }
    }
}

impl State {
    /// Return expired leases to the queue, dead-lettering exhausted jobs.
    fn recover_expired(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Active
                    && job.lease_expiry.map(|expiry| expiry <= now).unwrap_or(true)
            })
            .map(|job| job.id)
            .collect();

        let mut dead = Vec::new();
        for id in expired {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.attempts += 1;
            job.lease_expiry = None;
            job.leased_by = None;
            job.last_error = Some(LEASE_EXPIRED.to_string());
            job.updated_at = now;
            if job.attempts_exhausted() {
                job.status = JobStatus::Failed;
                if job.remove_on_fail {
                    self.jobs.remove(&id);
                }
                dead.push(id);
            } else {
                job.status = JobStatus::Queued;
                job.run_at = now;
            }
        }
        dead
    }

    fn claim_next(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Option<Job> {
        let next = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.run_at <= now)
            .min_by_key(|job| (job.run_at, job.created_at))
            .map(|job| job.id)?;

        let job = self.jobs.get_mut(&next)?;
        job.status = JobStatus::Active;
        job.leased_by = Some(worker_id.to_string());
        job.lease_expiry = Some(now + super::to_chrono(lease_duration));
        job.updated_at = now;
        Some(job.clone())
    }

    /// Time until the next queued job becomes due or a lease expires.
    fn next_wake(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.jobs
            .values()
            .filter_map(|job| match job.status {
                JobStatus::Queued => Some(job.run_at),
                JobStatus::Active => job.lease_expiry,
                _ => None,
            })
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        self.ensure_connected()?;
        let id = job.id;
        self.lock().jobs.insert(id, job);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, timeout: Duration) -> Result<Option<Job>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_connected()?;

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (claimed, dead, wait) = {
                let mut state = self.lock();
                let now = Utc::now();
                let dead = state.recover_expired(now);
                let claimed = state.claim_next(worker_id, now, self.lease_duration);
                let wait = state.next_wake(now);
                (claimed, dead, wait)
            };
            self.emit_dead_letters(dead);

            if let Some(job) = claimed {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = match wait {
                Some(wait) => deadline.min(now + wait.max(Duration::from_millis(1))),
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(
        &self,
        job_id: JobId,
        worker_id: &str,
        disposition: Disposition,
    ) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let requeued = {
            let mut state = self.lock();
            let job = state
                .jobs
                .get_mut(&job_id)
                .filter(|job| {
                    job.status == JobStatus::Active && job.leased_by.as_deref() == Some(worker_id)
                })
                .ok_or(StoreError::LeaseLost(job_id))?;

            let now = Utc::now();
            job.attempts += 1;
            job.lease_expiry = None;
            job.leased_by = None;
            job.updated_at = now;

            let purge = match disposition {
                Disposition::Complete { result } => {
                    job.status = JobStatus::Completed;
                    job.result = Some(result);
                    job.remove_on_complete
                }
                Disposition::Retry { error, delay } if !job.attempts_exhausted() => {
                    job.status = JobStatus::Queued;
                    job.run_at = now + super::to_chrono(delay);
                    job.last_error = Some(error);
                    false
                }
                Disposition::Retry { error, .. } | Disposition::Fail { error } => {
                    job.status = JobStatus::Failed;
                    job.last_error = Some(error);
                    job.remove_on_fail
                }
            };
            let requeued = job.status == JobStatus::Queued;
            if purge {
                state.jobs.remove(&job_id);
            }
            requeued
        };

        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| {
                job.status == JobStatus::Active && job.leased_by.as_deref() == Some(worker_id)
            })
            .ok_or(StoreError::LeaseLost(job_id))?;

        let now = Utc::now();
        let expiry = now + super::to_chrono(self.lease_duration);
        job.lease_expiry = Some(expiry);
        job.updated_at = now;
        Ok(expiry)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.ensure_connected()?;
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        Ok(self.lock().jobs.remove(&job_id).is_some())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        match state.jobs.get(&job_id).map(|job| job.status) {
            None => Err(StoreError::NotFound(job_id)),
            Some(JobStatus::Queued) => {
                state.jobs.remove(&job_id);
                Ok(())
            }
            Some(_) => Err(StoreError::AlreadyClaimed(job_id)),
        }
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        self.ensure_connected()?;
        let state = self.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.ensure_connected()?;
        let state = self.lock();
        let mut failed: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_connected()
    }
}
