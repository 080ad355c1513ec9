use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint for queue and worker metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the queue and workers emit.
pub fn describe_metrics() {
    metrics::describe_counter!("jobs_enqueued_total", "Total jobs accepted by the queue");
    metrics::describe_counter!("jobs_completed_total", "Total jobs that completed successfully");
    metrics::describe_counter!("jobs_failed_total", "Total jobs moved to the failed set");
    metrics::describe_counter!("jobs_retried_total", "Total transient failures scheduled for retry");
    metrics::describe_counter!(
        "store_disconnects_total",
        "Times the connection to the job store was lost"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time spent running a job handler"
    );
    metrics::describe_gauge!("job_queue_depth", "Jobs waiting to be claimed");
}
