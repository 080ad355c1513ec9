use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::event::QueueEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Non-blocking fan-out channel for queue and store lifecycle events.
///
/// Emitting never waits on subscribers: with nobody listening the event is
/// dropped, and a subscriber that falls behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: QueueEvent) {
        tracing::trace!(event = event.name(), "Emitting queue event");
        // Err only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscribe to the bus and forward every event to logs and metrics.
///
/// The task ends when every sender has been dropped.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => record(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn record(event: &QueueEvent) {
    match event {
        QueueEvent::JobCompleted { job_id } => {
            metrics::counter!("jobs_completed_total").increment(1);
            tracing::info!(job_id = %job_id, "Job has completed");
        }
        QueueEvent::JobFailed { job_id, reason } => {
            metrics::counter!("jobs_failed_total").increment(1);
            tracing::error!(job_id = %job_id, reason = %reason, "Job failed");
        }
        QueueEvent::JobRetrying {
            job_id,
            attempts,
            delay_ms,
        } => {
            metrics::counter!("jobs_retried_total").increment(1);
            tracing::warn!(job_id = %job_id, attempts, delay_ms, "Job scheduled for retry");
        }
        QueueEvent::StoreConnecting => tracing::info!("Connecting to job store"),
        QueueEvent::StoreReady => tracing::info!("Job store ready"),
        QueueEvent::StoreDisconnected { reason } => {
            metrics::counter!("store_disconnects_total").increment(1);
            tracing::warn!(reason = %reason, "Job store disconnected");
        }
        QueueEvent::StoreReconnecting { attempt } => {
            tracing::info!(attempt, "Reconnecting to job store");
        }
    }
}
