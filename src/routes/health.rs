use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::JobCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobCounts>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub store: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health: store connectivity plus per-status job counts.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let store_check = match state.queue.health_check().await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check: job store unreachable");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let healthy = store_check.status == "ok";
    let jobs = if healthy {
        match state.queue.counts().await {
            Ok(counts) => {
                metrics::gauge!("job_queue_depth").set(counts.queued as f64);
                Some(counts)
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { store: store_check },
        jobs,
    };

    (status_code, Json(response))
}
