//! Redis-backed job store.
//!
//! Layout, for a queue named `q`:
//!
//! - `q:job:{id}`  hash holding one job record
//! - `q:queued`    sorted set, score = `run_at` (ms)
//! - `q:active`    sorted set, score = `lease_expiry` (ms)
//! - `q:completed` sorted set, score = completion time (ms)
//! - `q:failed`    sorted set, score = failure time (ms)
//!
//! Claim, ack, lease extension and cancellation are Lua scripts so each runs
//! as one atomic round trip.
//!
//! The claim script derives job hash keys from the `q:job:` prefix at run time
//! instead of receiving them in `KEYS`, so the store needs a standalone (or
//! replicated) Redis deployment. Redis Cluster is not supported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Disposition, JobStore, StoreError, LEASE_EXPIRED};
use crate::models::event::QueueEvent;
use crate::models::job::{Job, JobCounts, JobId, JobStatus};
use crate::services::events::EventBus;
use crate::services::retry::ReconnectPolicy;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Recover expired leases, then claim the earliest due job.
///
/// KEYS[1] = queued, KEYS[2] = active, KEYS[3] = failed
/// ARGV[1] = now (ms), ARGV[2] = lease (ms), ARGV[3] = worker id,
/// ARGV[4] = job key prefix, ARGV[5] = lease-expired reason
///
/// Returns { claimed id or "", dead-lettered ids... }
const CLAIM_SCRIPT: &str = r#"
    local now = tonumber(ARGV[1])
    local result = { '' }

    local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
    for _, id in ipairs(expired) do
        local key = ARGV[4] .. id
        redis.call('ZREM', KEYS[2], id)
        if redis.call('EXISTS', key) == 1 then
            local attempts = redis.call('HINCRBY', key, 'attempts', 1)
            local max = tonumber(redis.call('HGET', key, 'max_attempts'))
            redis.call('HDEL', key, 'leased_by', 'lease_expiry')
            redis.call('HSET', key, 'updated_at', now, 'last_error', ARGV[5])
            if attempts >= max then
                table.insert(result, id)
                if redis.call('HGET', key, 'remove_on_fail') == '1' then
                    redis.call('DEL', key)
                else
                    redis.call('HSET', key, 'status', 'failed')
                    redis.call('ZADD', KEYS[3], now, id)
                end
            else
                redis.call('HSET', key, 'status', 'queued', 'run_at', now)
                redis.call('ZADD', KEYS[1], now, id)
            end
        end
    end

    local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
    if ready[1] then
        local id = ready[1]
        local key = ARGV[4] .. id
        local expiry = now + tonumber(ARGV[2])
        redis.call('ZREM', KEYS[1], id)
        redis.call('HSET', key, 'status', 'active', 'leased_by', ARGV[3],
            'lease_expiry', expiry, 'updated_at', now)
        redis.call('ZADD', KEYS[2], expiry, id)
        result[1] = id
    end

    return result
"#;

/// Finalize or requeue a job leased by the caller.
///
/// KEYS[1] = job key, KEYS[2] = queued, KEYS[3] = active,
/// KEYS[4] = completed, KEYS[5] = failed
/// ARGV[1] = job id, ARGV[2] = worker id, ARGV[3] = complete|retry|fail,
/// ARGV[4] = now (ms), ARGV[5] = run_at (ms), ARGV[6] = result json,
/// ARGV[7] = error
///
/// Returns 1 on success, 0 if the lease is not held.
const ACK_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'status') ~= 'active'
        or redis.call('HGET', KEYS[1], 'leased_by') ~= ARGV[2] then
        return 0
    end

    local id = ARGV[1]
    local now = ARGV[4]
    local attempts = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
    local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
    local kind = ARGV[3]
    if kind == 'retry' and attempts >= max then
        kind = 'fail'
    end

    redis.call('ZREM', KEYS[3], id)
    redis.call('HDEL', KEYS[1], 'leased_by', 'lease_expiry')
    redis.call('HSET', KEYS[1], 'updated_at', now)

    if kind == 'complete' then
        if redis.call('HGET', KEYS[1], 'remove_on_complete') == '1' then
            redis.call('DEL', KEYS[1])
            return 1
        end
        redis.call('HSET', KEYS[1], 'status', 'completed', 'result', ARGV[6])
        redis.call('ZADD', KEYS[4], now, id)
    elseif kind == 'retry' then
        redis.call('HSET', KEYS[1], 'status', 'queued', 'run_at', ARGV[5], 'last_error', ARGV[7])
        redis.call('ZADD', KEYS[2], ARGV[5], id)
    else
        if redis.call('HGET', KEYS[1], 'remove_on_fail') == '1' then
            redis.call('DEL', KEYS[1])
            return 1
        end
        redis.call('HSET', KEYS[1], 'status', 'failed', 'last_error', ARGV[7])
        redis.call('ZADD', KEYS[5], now, id)
    end
    return 1
"#;

/// KEYS[1] = job key, KEYS[2] = active
/// ARGV[1] = job id, ARGV[2] = worker id, ARGV[3] = new expiry (ms), ARGV[4] = now (ms)
const EXTEND_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'status') ~= 'active'
        or redis.call('HGET', KEYS[1], 'leased_by') ~= ARGV[2] then
        return 0
    end
    redis.call('HSET', KEYS[1], 'lease_expiry', ARGV[3], 'updated_at', ARGV[4])
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
    return 1
"#;

/// KEYS[1] = job key, KEYS[2] = queued
/// ARGV[1] = job id
///
/// Returns 1 = removed, 0 = not queued, -1 = missing
const CANCEL_SCRIPT: &str = r#"
    local status = redis.call('HGET', KEYS[1], 'status')
    if not status then
        return -1
    end
    if status ~= 'queued' then
        return 0
    end
    redis.call('DEL', KEYS[1])
    redis.call('ZREM', KEYS[2], ARGV[1])
    return 1
"#;

/// Connection and timing settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreSettings {
    pub url: String,
    pub queue_name: String,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

struct Keys {
    queued: String,
    active: String,
    completed: String,
    failed: String,
    job_prefix: String,
}

impl Keys {
    fn new(queue_name: &str) -> Self {
        Self {
            queued: format!("{queue_name}:queued"),
            active: format!("{queue_name}:active"),
            completed: format!("{queue_name}:completed"),
            failed: format!("{queue_name}:failed"),
            job_prefix: format!("{queue_name}:job:"),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}{id}", self.job_prefix)
    }
}

struct Slot {
    generation: u64,
    conn: Option<MultiplexedConnection>,
}

/// State shared with the connection supervisor task.
struct Inner {
    client: redis::Client,
    slot: RwLock<Slot>,
    lost: Notify,
    closed: AtomicBool,
    events: EventBus,
}

impl Inner {
    async fn connection(&self) -> Result<(u64, MultiplexedConnection), StoreError> {
        let slot = self.slot.read().await;
        match &slot.conn {
            Some(conn) => Ok((slot.generation, conn.clone())),
            None => Err(StoreError::Unavailable("not connected to Redis".to_string())),
        }
    }

    async fn install(&self, conn: MultiplexedConnection) {
        let mut slot = self.slot.write().await;
        slot.generation += 1;
        slot.conn = Some(conn);
    }

    /// Drop the connection of `generation` and wake the supervisor.
    async fn mark_lost(&self, generation: u64, reason: String) {
        let mut slot = self.slot.write().await;
        if slot.generation != generation || slot.conn.is_none() {
            return;
        }
        slot.conn = None;
        drop(slot);
        self.events.emit(QueueEvent::StoreDisconnected { reason });
        self.lost.notify_one();
    }

    /// Map a command result, treating connection-class errors as an outage.
    async fn check<T>(&self, generation: u64, result: RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) if is_connection_error(&err) => {
                let reason = err.to_string();
                self.mark_lost(generation, reason.clone()).await;
                Err(StoreError::Unavailable(reason))
            }
            Err(err) => Err(StoreError::Redis(err)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Owns the Redis connection: connects, and reconnects with backoff after loss.
async fn supervise(inner: Arc<Inner>, policy: ReconnectPolicy) {
    inner.events.emit(QueueEvent::StoreConnecting);
    let mut reconnecting = false;

    loop {
        let mut attempt: u32 = 0;
        loop {
            if inner.is_closed() {
                return;
            }
            if reconnecting || attempt > 0 {
                inner.events.emit(QueueEvent::StoreReconnecting {
                    attempt: attempt + 1,
                });
            }

            match inner
                .client
                .get_multiplexed_async_connection_with_timeouts(RESPONSE_TIMEOUT, CONNECT_TIMEOUT)
                .await
            {
                Ok(conn) => {
                    inner.install(conn).await;
                    inner.events.emit(QueueEvent::StoreReady);
                    break;
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Redis connection failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        inner.lost.notified().await;
        reconnecting = true;
    }
}

/// Job store backed by Redis hashes and sorted sets.
pub struct RedisStore {
    inner: Arc<Inner>,
    keys: Keys,
    lease_duration: Duration,
    poll_interval: Duration,
    claim_script: Script,
    ack_script: Script,
    extend_script: Script,
    cancel_script: Script,
}

impl RedisStore {
    /// Create the store and start connecting in the background.
    ///
    /// Fails only on an invalid URL; connectivity problems are reported on the
    /// event bus and retried forever. Must be called inside a tokio runtime.
    pub fn open(settings: RedisStoreSettings, events: EventBus) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.url.as_str())?;
        let inner = Arc::new(Inner {
            client,
            slot: RwLock::new(Slot {
                generation: 0,
                conn: None,
            }),
            lost: Notify::new(),
            closed: AtomicBool::new(false),
            events,
        });

        tokio::spawn(supervise(Arc::clone(&inner), settings.reconnect));

        Ok(Self {
            inner,
            keys: Keys::new(&settings.queue_name),
            lease_duration: settings.lease_duration,
            poll_interval: settings.poll_interval,
            claim_script: Script::new(CLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
        })
    }

    /// Wait until the first connection is established, up to `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.slot.read().await.conn.is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        generation: u64,
        job_id: JobId,
    ) -> Result<Option<Job>, StoreError> {
        let result: RedisResult<HashMap<String, String>> = conn.hgetall(self.keys.job(job_id)).await;
        let fields = self.inner.check(generation, result).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(fields).map(Some)
    }

    fn emit_dead_letters(&self, ids: &[String]) {
        for id in ids {
            match Uuid::parse_str(id) {
                Ok(job_id) => self.inner.events.emit(QueueEvent::JobFailed {
                    job_id,
                    reason: LEASE_EXPIRED.to_string(),
                }),
                Err(_) => tracing::warn!(id = %id, "Ignoring malformed job id in failed set"),
            }
        }
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.lost.notify_one();
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        let fields = job_fields(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.keys.job(job.id), fields.as_slice())
            .ignore()
            .zadd(&self.keys.queued, job.id.to_string(), job.run_at.timestamp_millis())
            .ignore();

        let (generation, mut conn) = self.inner.connection().await?;
        let result: RedisResult<()> = pipe.query_async(&mut conn).await;
        self.inner.check(generation, result).await?;
        Ok(job.id)
    }

    async fn claim(&self, worker_id: &str, timeout: Duration) -> Result<Option<Job>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let (generation, mut conn) = self.inner.connection().await?;
            let result: RedisResult<Vec<String>> = self
                .claim_script
                .key(&self.keys.queued)
                .key(&self.keys.active)
                .key(&self.keys.failed)
                .arg(Utc::now().timestamp_millis())
                .arg(self.lease_duration.as_millis() as i64)
                .arg(worker_id)
                .arg(&self.keys.job_prefix)
                .arg(LEASE_EXPIRED)
                .invoke_async(&mut conn)
                .await;
            let ids = self.inner.check(generation, result).await?;

            let (claimed, dead) = match ids.split_first() {
                Some((first, rest)) => (first.as_str(), rest),
                None => ("", &[][..]),
            };
            self.emit_dead_letters(dead);

            if !claimed.is_empty() {
                let job_id = Uuid::parse_str(claimed)
                    .map_err(|e| StoreError::Corrupt(format!("job id {claimed}: {e}")))?;
                if let Some(job) = self.load(&mut conn, generation, job_id).await? {
                    return Ok(Some(job));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(
        &self,
        job_id: JobId,
        worker_id: &str,
        disposition: Disposition,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let (run_at, result, error) = match &disposition {
            Disposition::Complete { result } => (now, serde_json::to_string(result)?, String::new()),
            Disposition::Retry { error, delay } => {
                (now + super::to_chrono(*delay), String::new(), error.clone())
            }
            Disposition::Fail { error } => (now, String::new(), error.clone()),
        };

        let (generation, mut conn) = self.inner.connection().await?;
        let acked: RedisResult<i64> = self
            .ack_script
            .key(self.keys.job(job_id))
            .key(&self.keys.queued)
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(disposition.kind())
            .arg(now.timestamp_millis())
            .arg(run_at.timestamp_millis())
            .arg(result)
            .arg(error)
            .invoke_async(&mut conn)
            .await;

        match self.inner.check(generation, acked).await? {
            0 => Err(StoreError::LeaseLost(job_id)),
            _ => Ok(()),
        }
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let expiry = now + super::to_chrono(self.lease_duration);

        let (generation, mut conn) = self.inner.connection().await?;
        let extended: RedisResult<i64> = self
            .extend_script
            .key(self.keys.job(job_id))
            .key(&self.keys.active)
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(expiry.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await;

        match self.inner.check(generation, extended).await? {
            0 => Err(StoreError::LeaseLost(job_id)),
            _ => Ok(expiry),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let (generation, mut conn) = self.inner.connection().await?;
        self.load(&mut conn, generation, job_id).await
    }

    async fn remove(&self, job_id: JobId) -> Result<bool, StoreError> {
        let member = job_id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.keys.job(job_id))
            .zrem(&self.keys.queued, &member)
            .ignore()
            .zrem(&self.keys.active, &member)
            .ignore()
            .zrem(&self.keys.completed, &member)
            .ignore()
            .zrem(&self.keys.failed, &member)
            .ignore();

        let (generation, mut conn) = self.inner.connection().await?;
        let result: RedisResult<(i64,)> = pipe.query_async(&mut conn).await;
        let (deleted,) = self.inner.check(generation, result).await?;
        Ok(deleted > 0)
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), StoreError> {
        let (generation, mut conn) = self.inner.connection().await?;
        let result: RedisResult<i64> = self
            .cancel_script
            .key(self.keys.job(job_id))
            .key(&self.keys.queued)
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await;

        match self.inner.check(generation, result).await? {
            1 => Ok(()),
            0 => Err(StoreError::AlreadyClaimed(job_id)),
            _ => Err(StoreError::NotFound(job_id)),
        }
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let mut pipe = redis::pipe();
        pipe.zcard(&self.keys.queued)
            .zcard(&self.keys.active)
            .zcard(&self.keys.completed)
            .zcard(&self.keys.failed);

        let (generation, mut conn) = self.inner.connection().await?;
        let result: RedisResult<(u64, u64, u64, u64)> = pipe.query_async(&mut conn).await;
        let (queued, active, completed, failed) = self.inner.check(generation, result).await?;
        Ok(JobCounts {
            queued,
            active,
            completed,
            failed,
        })
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (generation, mut conn) = self.inner.connection().await?;
        let result: RedisResult<Vec<String>> = conn
            .zrevrange(&self.keys.failed, 0, last_rank(limit))
            .await;
        let ids = self.inner.check(generation, result).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(job_id) = Uuid::parse_str(&id) else {
                tracing::warn!(id = %id, "Ignoring malformed job id in failed set");
                continue;
            };
            if let Some(job) = self.load(&mut conn, generation, job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let (generation, mut conn) = self.inner.connection().await?;
        let result = redis::cmd("PING").query_async::<String>(&mut conn).await;
        self.inner.check(generation, result).await?;
        Ok(())
    }
}

/// Flatten a job into hash fields. Optional fields are omitted when unset.
fn job_fields(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    let bool_flag = |flag: bool| if flag { "1" } else { "0" }.to_string();

    let mut fields = vec![
        ("id", job.id.to_string()),
        ("type", job.job_type.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("status", job.status.to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("run_at", job.run_at.timestamp_millis().to_string()),
        ("remove_on_complete", bool_flag(job.remove_on_complete)),
        ("remove_on_fail", bool_flag(job.remove_on_fail)),
        ("created_at", job.created_at.timestamp_millis().to_string()),
        ("updated_at", job.updated_at.timestamp_millis().to_string()),
    ];
    if let Some(expiry) = job.lease_expiry {
        fields.push(("lease_expiry", expiry.timestamp_millis().to_string()));
    }
    if let Some(worker) = &job.leased_by {
        fields.push(("leased_by", worker.clone()));
    }
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    Ok(fields)
}

fn job_from_fields(mut fields: HashMap<String, String>) -> Result<Job, StoreError> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| StoreError::Corrupt(format!("missing field `{name}`")))
    };

    let id = take("id")?;
    let job_type = take("type")?;
    let payload = take("payload")?;
    let status = take("status")?;
    let attempts = take("attempts")?;
    let max_attempts = take("max_attempts")?;
    let run_at = take("run_at")?;
    let remove_on_complete = take("remove_on_complete")?;
    let remove_on_fail = take("remove_on_fail")?;
    let created_at = take("created_at")?;
    let updated_at = take("updated_at")?;
    let lease_expiry = take("lease_expiry").ok();
    let leased_by = take("leased_by").ok();
    let result = take("result").ok().filter(|r| !r.is_empty());
    let last_error = take("last_error").ok().filter(|e| !e.is_empty());

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id: {e}")))?,
        job_type,
        payload: serde_json::from_str(&payload)?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(format!("status `{status}`: {e}")))?,
        attempts: parse_number(&attempts, "attempts")?,
        max_attempts: parse_number(&max_attempts, "max_attempts")?,
        lease_expiry: lease_expiry.map(|ms| parse_millis(&ms)).transpose()?,
        leased_by,
        run_at: parse_millis(&run_at)?,
        remove_on_complete: remove_on_complete == "1",
        remove_on_fail: remove_on_fail == "1",
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        last_error,
        created_at: parse_millis(&created_at)?,
        updated_at: parse_millis(&updated_at)?,
    })
}

/// Inclusive stop rank for a `ZREVRANGE` returning at most `limit` members.
fn last_rank(limit: usize) -> isize {
    isize::try_from(limit).unwrap_or(isize::MAX) - 1
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("{name} `{value}` is not a number")))
}

fn parse_millis(value: &str) -> Result<DateTime<Utc>, StoreError> {
    let millis: i64 = parse_number(value, "timestamp")?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}
