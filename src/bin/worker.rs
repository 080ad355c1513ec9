use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use transcode_queue::{
    config::AppConfig,
    models::transcode::TRANSCODE_JOB,
    routes::metrics::describe_metrics,
    services::{
        events::{spawn_event_logger, EventBus},
        store::{JobStore, RedisStore},
        transcode::TranscodeHandler,
        worker::WorkerPool,
    },
};

const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting audio transcode worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        describe_metrics();
        tracing::info!(%addr, "Worker metrics exporter listening");
    }

    let events = EventBus::new();
    let _event_logger = spawn_event_logger(&events);

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job store");
    let store: Arc<dyn JobStore> = Arc::new(
        RedisStore::open(config.store_settings(), events.clone())
            .expect("Invalid Redis configuration"),
    );

    let mut pool = WorkerPool::new(
        Arc::clone(&store),
        config.retry_policy(),
        config.worker_settings(),
        events,
    );
    pool.register_handler(
        TRANSCODE_JOB,
        Arc::new(TranscodeHandler::new(Duration::from_millis(
            config.transcode_duration_ms,
        ))),
    )
    .expect("Failed to register transcode handler");
    pool.start(config.worker_concurrency)
        .expect("Failed to start worker pool");

    let sampler = tokio::spawn(sample_queue_depth(store));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, draining workers");

    sampler.abort();
    pool.stop().await;
}

async fn sample_queue_depth(store: Arc<dyn JobStore>) {
    let mut ticker = tokio::time::interval(DEPTH_SAMPLE_INTERVAL);
    loop {
        ticker.tick().await;
        match store.counts().await {
            Ok(counts) => metrics::gauge!("job_queue_depth").set(counts.queued as f64),
            Err(e) => tracing::debug!(error = %e, "Queue depth sample skipped"),
        }
    }
}
