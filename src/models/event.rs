use serde::Serialize;

use crate::models::job::JobId;

/// Connection and job lifecycle notifications for operators.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, strum::IntoStaticStr)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    #[serde(rename = "job.completed")]
    #[strum(serialize = "job.completed")]
    JobCompleted { job_id: JobId },

    #[serde(rename = "job.failed")]
    #[strum(serialize = "job.failed")]
    JobFailed { job_id: JobId, reason: String },

    #[serde(rename = "job.retrying")]
    #[strum(serialize = "job.retrying")]
    JobRetrying {
        job_id: JobId,
        attempts: u32,
        delay_ms: u64,
    },

    #[serde(rename = "store.connecting")]
    #[strum(serialize = "store.connecting")]
    StoreConnecting,

    #[serde(rename = "store.ready")]
    #[strum(serialize = "store.ready")]
    StoreReady,

    #[serde(rename = "store.disconnected")]
    #[strum(serialize = "store.disconnected")]
    StoreDisconnected { reason: String },

    #[serde(rename = "store.reconnecting")]
    #[strum(serialize = "store.reconnecting")]
    StoreReconnecting { attempt: u32 },
}

impl QueueEvent {
    /// Dotted event name, e.g. `job.completed`.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
