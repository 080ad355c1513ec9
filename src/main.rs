use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use transcode_queue::{
    app_state::AppState,
    config::AppConfig,
    models::transcode::{TranscodePayload, TRANSCODE_JOB},
    routes,
    services::{
        events::{spawn_event_logger, EventBus},
        queue::JobQueue,
        store::RedisStore,
    },
};

const STORE_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing transcode-queue server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    let events = EventBus::new();
    let _event_logger = spawn_event_logger(&events);

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job store");
    let store = RedisStore::open(config.store_settings(), events.clone())
        .expect("Invalid Redis configuration");
    if !store.wait_until_ready(STORE_READY_TIMEOUT).await {
        // Producers get 503 until the supervisor reconnects.
        tracing::warn!("Redis not reachable yet, starting in degraded mode");
    }

    let mut queue = JobQueue::new(Arc::new(store), config.job_defaults());
    queue.register_schema::<TranscodePayload>(TRANSCODE_JOB);

    let app = routes::router(AppState::new(queue), prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
