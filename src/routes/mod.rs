pub mod health;
pub mod metrics;
pub mod transcode;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

const BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Build the HTTP router for the producer API.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/transcode-audio", post(transcode::submit_transcode))
        .route("/api/jobs/failed", get(transcode::list_failed_jobs))
        .route(
            "/api/jobs/{job_id}",
            get(transcode::get_job_status).delete(transcode::cancel_job),
        )
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
