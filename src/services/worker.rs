//! Worker pool: concurrent claim/execute/ack loops over registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::models::event::QueueEvent;
use crate::models::job::{Job, JobId, Payload};
use crate::services::events::EventBus;
use crate::services::retry::{ReconnectPolicy, RetryPolicy};
use crate::services::store::{Disposition, JobStore, StoreError};

/// Processes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError>;
}

/// Failure reported by a handler, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Network, backend or timeout errors. Retried with backoff.
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// Invalid payload and similar. Never retried.
    #[error("Permanent job failure: {0}")]
    Permanent(String),

    #[error("No handler registered for job type '{0}'")]
    UnregisteredHandler(String),
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, HandlerError::Transient(_))
    }
}

/// Adapter turning an async `payload -> result` closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        (self.0)(job.payload.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-worker timing settings.
///
/// `lease_duration` must match the store's lease so heartbeats land in time.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Prefix for worker ids (`{name}-{index}`).
    pub name: String,
    pub claim_timeout: Duration,
    pub lease_duration: Duration,
    /// Backoff while the store is unreachable.
    pub idle_backoff: ReconnectPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            claim_timeout: Duration::from_secs(1),
            lease_duration: Duration::from_secs(30),
            idle_backoff: ReconnectPolicy::default(),
        }
    }
}

impl WorkerSettings {
    fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }
}

pub fn default_worker_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker pool needs at least one worker")]
    NoWorkers,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of workers sharing one store and handler registry.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    settings: WorkerSettings,
    events: EventBus,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    running: Option<Running>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: RetryPolicy,
        settings: WorkerSettings,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            policy,
            settings,
            events,
            handlers: HashMap::new(),
            running: None,
        }
    }

    /// Register the handler for `job_type`. The last registration wins.
    pub fn register_handler(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), PoolError> {
        if self.running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing previously registered job handler");
        } else {
            tracing::info!(job_type = %job_type, "Registered job handler");
        }
        Ok(())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn `concurrency` workers. Each runs until [`WorkerPool::stop`].
    pub fn start(&mut self, concurrency: usize) -> Result<(), PoolError> {
        if self.running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }
        if concurrency == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(self.handlers.clone());
        let tasks = (0..concurrency)
            .map(|index| {
                let worker = Worker {
                    id: format!("{}-{}", self.settings.name, index),
                    store: Arc::clone(&self.store),
                    policy: self.policy,
                    settings: self.settings.clone(),
                    events: self.events.clone(),
                    handlers: Arc::clone(&handlers),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        tracing::info!(
            concurrency,
            name = %self.settings.name,
            job_types = ?self.registered_types(),
            "Worker pool started"
        );
        self.running = Some(Running { shutdown, tasks });
        Ok(())
    }

    /// Signal every worker to exit after its current job, then wait for them.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        tracing::info!("Worker pool waiting for in-flight jobs to complete");

        for result in futures::future::join_all(running.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool shut down complete");
    }
}

struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    settings: WorkerSettings,
    events: EventBus,
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker_id = %self.id, "Worker started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.claim(&self.id, self.settings.claim_timeout).await {
                Ok(Some(job)) => {
                    failures = 0;
                    self.process(job).await;
                }
                Ok(None) => {
                    failures = 0;
                    tracing::trace!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    let delay = self.settings.idle_backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    if e.is_unavailable() {
                        tracing::debug!(worker_id = %self.id, error = %e, "Store unavailable, backing off");
                    } else {
                        tracing::error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        let started = Instant::now();
        tracing::info!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            worker_id = %self.id,
            "Processing job"
        );

        let outcome = match self.handlers.get(&job.job_type) {
            Some(handler) => self.execute(Arc::clone(handler), &job).await,
            None => Err(HandlerError::UnregisteredHandler(job.job_type.clone())),
        };
        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());

        let disposition = self.policy.decide(&job, outcome);
        let event = match &disposition {
            Disposition::Complete { .. } => QueueEvent::JobCompleted { job_id },
            Disposition::Retry { delay, .. } => QueueEvent::JobRetrying {
                job_id,
                attempts: job.attempts + 1,
                delay_ms: delay.as_millis() as u64,
            },
            Disposition::Fail { error } => QueueEvent::JobFailed {
                job_id,
                reason: error.clone(),
            },
        };

        match self.acknowledge(job_id, disposition).await {
            Ok(()) => self.events.emit(event),
            Err(StoreError::LeaseLost(_)) => {
                tracing::warn!(job_id = %job_id, worker_id = %self.id, "Lease lost before acknowledgement, outcome discarded");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to acknowledge job, leaving it to lease recovery");
            }
        }
    }

    /// Run the handler in its own task, renewing the lease while it works.
    async fn execute(&self, handler: Arc<dyn JobHandler>, job: &Job) -> Result<Value, HandlerError> {
        let task_job = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(&task_job).await });

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval());
        heartbeat.tick().await;
        let mut lease_held = true;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => {
                            Err(HandlerError::Transient("handler panicked".to_string()))
                        }
                        Err(e) => Err(HandlerError::Transient(format!("handler task failed: {e}"))),
                    };
                }
                _ = heartbeat.tick(), if lease_held => {
                    match self.store.extend_lease(job.id, &self.id).await {
                        Ok(_) => {}
                        Err(StoreError::LeaseLost(_)) => {
                            tracing::warn!(job_id = %job.id, worker_id = %self.id, "Lease lost while handler running");
                            lease_held = false;
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %e, "Failed to extend lease");
                        }
                    }
                }
            }
        }
    }

    /// Ack, retrying through store outages for as long as the lease would last.
    async fn acknowledge(&self, job_id: JobId, disposition: Disposition) -> Result<(), StoreError> {
        let give_up = Instant::now() + self.settings.lease_duration;
        let mut attempt: u32 = 0;
        loop {
            match self.store.ack(job_id, &self.id, disposition.clone()).await {
                Err(e) if e.is_unavailable() && Instant::now() < give_up => {
                    let delay = self.settings.idle_backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(job_id = %job_id, error = %e, attempt, "Ack failed, store unavailable");
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
