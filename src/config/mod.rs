use std::time::Duration;

use serde::Deserialize;

use crate::models::job::JobDefaults;
use crate::services::retry::{ReconnectPolicy, RetryPolicy};
use crate::services::store::RedisStoreSettings;
use crate::services::worker::{default_worker_name, WorkerSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Full Redis connection string. Takes precedence over host/port.
    pub redis_url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Queue name, used as the Redis key prefix
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Worker id prefix. Generated when unset.
    pub worker_name: Option<String>,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// How long a claim stays valid without a heartbeat
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// How long one claim call waits for a job before returning empty
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Simulated transcoding time per job
    #[serde(default = "default_transcode_duration_ms")]
    pub transcode_duration_ms: u64,

    /// Prometheus listener for the worker process (e.g., "0.0.0.0:9091")
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_queue_name() -> String {
    "audioTranscode".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_claim_timeout_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_reconnect_base_delay_ms() -> u64 {
    250
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_transcode_duration_ms() -> u64 {
    5_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_url {
            Some(url) => url.clone(),
            None => format!("redis://{}:{}/", self.redis_host, self.redis_port),
        }
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            max_attempts: self.default_max_attempts,
            ..JobDefaults::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn store_settings(&self) -> RedisStoreSettings {
        RedisStoreSettings {
            url: self.redis_url(),
            queue_name: self.queue_name.clone(),
            lease_duration: self.lease_duration(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect: self.reconnect_policy(),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            name: self.worker_name.clone().unwrap_or_else(default_worker_name),
            claim_timeout: Duration::from_millis(self.claim_timeout_ms),
            lease_duration: self.lease_duration(),
            idle_backoff: self.reconnect_policy(),
        }
    }
}
