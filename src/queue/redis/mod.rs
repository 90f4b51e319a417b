//! Redis broker.
//!
//! Durable and shared between processes. Every state transition runs as a
//! Lua script so that leasing, acknowledging and failing are atomic on the
//! server.
//!
//! # Layout
//!
//! All keys live under `{key_prefix}:{queue_name}`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `job:{id}` | hash | the job record, one field per attribute |
//! | `job:{id}:log` | list | JSON log entries, oldest first |
//! | `waiting` | zset | ready ids scored by priority, then insertion order |
//! | `scheduled` | zset | delayed ids scored by eligibility time (ms) |
//! | `seq` | string | insertion counter for `waiting` scores |
//! | `active` | zset | leased ids scored by lease expiry (ms) |
//! | `completed` | zset | completed ids scored by finish time (ms) |
//! | `failed` | zset | failed ids scored by finish time (ms) |
//!
//! `lease` moves due `scheduled` ids into `waiting` before popping the
//! lowest score. Terminal sets are trimmed to `keep_completed` and
//! `keep_failed` inside the script that adds to them.

use super::QueueBackend;
use crate::config::BrokerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::job::{JobCounts, JobId, JobRecord, JobStatus, LogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Redis broker implementation
pub struct RedisQueue {
    conn: ConnectionManager,
    /// Prefix shared by every key of this queue
    base: String,
    keep_completed: usize,
    keep_failed: usize,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

/// Prepend the shared Lua helpers to a script.
macro_rules! with_common {
    ($path:literal) => {
        concat!(include_str!("scripts/common.lua"), include_str!($path))
    };
}

/// Lua scripts for the atomic transitions
struct RedisScripts {
    enqueue: Script,
    lease: Script,
    extend: Script,
    complete: Script,
    reschedule: Script,
    fail: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(with_common!("scripts/enqueue.lua")),
            lease: Script::new(with_common!("scripts/lease.lua")),
            extend: Script::new(include_str!("scripts/extend.lua")),
            complete: Script::new(with_common!("scripts/complete.lua")),
            reschedule: Script::new(with_common!("scripts/reschedule.lua")),
            fail: Script::new(with_common!("scripts/fail.lua")),
        }
    }
}

impl RedisQueue {
    /// Connect to Redis and bind to `queue_name`.
    pub async fn connect(config: &BrokerConfig, queue_name: &str) -> WorkerResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let conn = timeout(
            Duration::from_millis(config.operation_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        .map_err(|e| WorkerError::broker("Timed out connecting to Redis", e))??;

        let base = format!("{}:{}", config.key_prefix, queue_name);
        info!(queue = %base, "Connected to Redis");

        Ok(Self {
            conn,
            base,
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
            scripts: RedisScripts::new(),
        })
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.base, job_id)
    }

    fn log_key(&self, job_id: &str) -> String {
        format!("{}:job:{}:log", self.base, job_id)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn waiting_key(&self) -> String {
        format!("{}:waiting", self.base)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.base)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.base)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.base)
    }

    fn completed_key(&self) -> String {
        format!("{}:completed", self.base)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.base)
    }

    /// Translate a transition script's status code.
    fn check_transition(job_id: &str, code: i64) -> WorkerResult<()> {
        match code {
            1 => Ok(()),
            -1 => Err(WorkerError::JobNotFound {
                job_id: job_id.to_string(),
            }),
            _ => Err(WorkerError::LeaseLost {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Rebuild a record from its hash fields and log entries.
    fn decode_record(
        job_id: &str,
        fields: &HashMap<String, String>,
        log: Vec<String>,
    ) -> WorkerResult<JobRecord> {
        let log = log
            .iter()
            .map(|line| serde_json::from_str::<LogEntry>(line))
            .collect::<Result<Vec<_>, _>>()?;

        let result = match fields.get("result").map(String::as_str) {
            None | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw)?),
        };

        Ok(JobRecord {
            id: job_id.to_string(),
            job_type: text(fields, job_id, "type")?,
            payload: serde_json::from_str(&text(fields, job_id, "payload")?)?,
            status: JobStatus::from_str(&text(fields, job_id, "status")?)
                .map_err(WorkerError::invalid_job)?,
            attempts_made: number(fields, job_id, "attempts_made")?,
            max_attempts: number(fields, job_id, "max_attempts")?,
            backoff_delay_ms: number(fields, job_id, "backoff_ms")?,
            priority: number(fields, job_id, "priority")?,
            log,
            result,
            error: fields.get("error").filter(|e| !e.is_empty()).cloned(),
            created_at: timestamp(fields, job_id, "created_at_ms")?,
            updated_at: timestamp(fields, job_id, "updated_at_ms")?,
            available_at: timestamp(fields, job_id, "available_at_ms")?,
            finished_at: match fields.get("finished_at_ms") {
                Some(_) => Some(timestamp(fields, job_id, "finished_at_ms")?),
                None => None,
            },
            lease_token: fields.get("lease_token").filter(|t| !t.is_empty()).cloned(),
        })
    }
}

fn text(fields: &HashMap<String, String>, job_id: &str, name: &str) -> WorkerResult<String> {
    fields
        .get(name)
        .cloned()
        .ok_or_else(|| WorkerError::invalid_job(format!("job {job_id} is missing field '{name}'")))
}

fn number<T: FromStr>(fields: &HashMap<String, String>, job_id: &str, name: &str) -> WorkerResult<T> {
    text(fields, job_id, name)?
        .parse()
        .map_err(|_| WorkerError::invalid_job(format!("job {job_id} has a malformed '{name}'")))
}

fn timestamp(
    fields: &HashMap<String, String>,
    job_id: &str,
    name: &str,
) -> WorkerResult<DateTime<Utc>> {
    let ms: i64 = number(fields, job_id, name)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WorkerError::invalid_job(format!("job {job_id} has an out of range '{name}'")))
}

fn log_line(entry: &LogEntry) -> WorkerResult<String> {
    Ok(serde_json::to_string(entry)?)
}

fn expiry_ms(now: i64, lease_timeout: Duration) -> i64 {
    now.saturating_add(i64::try_from(lease_timeout.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, job: JobRecord) -> WorkerResult<JobId> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&job.payload)?;

        let stored: i64 = self
            .scripts
            .enqueue
            .key(self.job_key(&job.id))
            .key(self.waiting_key())
            .key(self.scheduled_key())
            .key(self.seq_key())
            .arg(&job.id)
            .arg(&job.job_type)
            .arg(payload)
            .arg(job.max_attempts)
            .arg(job.backoff_delay_ms)
            .arg(job.created_at.timestamp_millis())
            .arg(job.available_at.timestamp_millis())
            .arg(job.priority)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if stored == 0 {
            debug!(job_id = %job.id, "Job already stored");
        }
        Ok(job.id)
    }

    async fn lease(&self, token: &str, lease_timeout: Duration) -> WorkerResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();

        let leased: Option<(String, HashMap<String, String>, Vec<String>)> = self
            .scripts
            .lease
            .key(self.waiting_key())
            .key(self.scheduled_key())
            .key(self.active_key())
            .key(self.failed_key())
            .key(self.seq_key())
            .arg(now)
            .arg(expiry_ms(now, lease_timeout))
            .arg(token)
            .arg(self.job_key_prefix())
            .arg(self.keep_failed)
            .arg(log_line(&LogEntry::failed("lease expired"))?)
            .invoke_async(&mut conn)
            .await?;

        match leased {
            Some((job_id, fields, log)) => Self::decode_record(&job_id, &fields, log).map(Some),
            None => Ok(None),
        }
    }

    async fn extend_lease(
        &self,
        job_id: &str,
        token: &str,
        lease_timeout: Duration,
    ) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let code: i64 = self
            .scripts
            .extend
            .key(self.job_key(job_id))
            .key(self.active_key())
            .arg(job_id)
            .arg(token)
            .arg(expiry_ms(now, lease_timeout))
            .invoke_async(&mut conn)
            .await?;
        Self::check_transition(job_id, code)
    }

    async fn complete(
        &self,
        job_id: &str,
        token: &str,
        result: serde_json::Value,
    ) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .complete
            .key(self.job_key(job_id))
            .key(self.active_key())
            .key(self.completed_key())
            .key(self.log_key(job_id))
            .arg(job_id)
            .arg(token)
            .arg(serde_json::to_string(&result)?)
            .arg(Utc::now().timestamp_millis())
            .arg(log_line(&LogEntry::completed())?)
            .arg(self.keep_completed)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        Self::check_transition(job_id, code)
    }

    async fn reschedule(
        &self,
        job_id: &str,
        token: &str,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .reschedule
            .key(self.job_key(job_id))
            .key(self.active_key())
            .key(self.waiting_key())
            .key(self.scheduled_key())
            .key(self.seq_key())
            .key(self.log_key(job_id))
            .arg(job_id)
            .arg(token)
            .arg(available_at.timestamp_millis())
            .arg(Utc::now().timestamp_millis())
            .arg(log_line(&LogEntry::failed(error))?)
            .invoke_async(&mut conn)
            .await?;
        Self::check_transition(job_id, code)?;

        debug!(job_id, retry_at = %available_at, "Rescheduled job after error: {}", error);
        Ok(())
    }

    async fn fail(&self, job_id: &str, token: &str, error: &str) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .fail
            .key(self.job_key(job_id))
            .key(self.active_key())
            .key(self.failed_key())
            .key(self.log_key(job_id))
            .arg(job_id)
            .arg(token)
            .arg(error)
            .arg(Utc::now().timestamp_millis())
            .arg(log_line(&LogEntry::failed(error))?)
            .arg(self.keep_failed)
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await?;
        Self::check_transition(job_id, code)
    }

    async fn append_log(&self, job_id: &str, entry: LogEntry) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.job_key(job_id)).await?;
        if !exists {
            return Err(WorkerError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }

        let line = serde_json::to_string(&entry)?;
        let _: i64 = conn.rpush(self.log_key(job_id), line).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> WorkerResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let (fields, log): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(self.job_key(job_id))
            .lrange(self.log_key(job_id), 0, -1)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        Self::decode_record(job_id, &fields, log).map(Some)
    }

    async fn counts(&self) -> WorkerResult<JobCounts> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();

        let (ready, due, delayed, active, completed, failed): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.waiting_key())
                .zcount(self.scheduled_key(), "-inf", now)
                .zcount(self.scheduled_key(), format!("({now}"), "+inf")
                .zcard(self.active_key())
                .zcard(self.completed_key())
                .zcard(self.failed_key())
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting: ready + due,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn health_check(&self) -> WorkerResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;

        if pong != "PONG" {
            return Err(WorkerError::Broker {
                message: format!("Redis health check failed: unexpected reply '{pong}'"),
                source: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // These tests need a running Redis; run them with `--ignored`.

    const LEASE: Duration = Duration::from_secs(30);

    async fn test_queue() -> RedisQueue {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = BrokerConfig {
            key_prefix: format!("jobsmith-test-{}", uuid::Uuid::new_v4()),
            ..BrokerConfig::redis(url)
        };
        RedisQueue::connect(&config, "jobs")
            .await
            .expect("Failed to connect to Redis")
    }

    fn job(max_attempts: u32) -> JobRecord {
        JobRecord::new("email.send", json!({"to": "x@example.com"}), max_attempts, 20)
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lease_and_complete() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(3)).await.unwrap();

        let leased = queue.lease("t1", LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id, job_id);
        assert_eq!(leased.status, JobStatus::Active);
        assert_eq!(leased.attempts_made, 1);
        assert_eq!(leased.payload, json!({"to": "x@example.com"}));

        queue
            .append_log(&job_id, LogEntry::now("Dispatching email notification."))
            .await
            .unwrap();
        queue
            .complete(&job_id, "t1", json!({"delivered": true}))
            .await
            .unwrap();

        let record = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(json!({"delivered": true})));
        let messages: Vec<_> = record.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["Dispatching email notification.", "Job completed."]);
        assert!(record.finished_at.is_some());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting + counts.active, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_stale_token_rejected() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(3)).await.unwrap();
        queue.lease("holder", LEASE).await.unwrap().unwrap();

        let err = queue.fail(&job_id, "intruder", "nope").await.unwrap_err();
        assert!(matches!(err, WorkerError::LeaseLost { .. }));

        let err = queue
            .complete("missing", "holder", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::JobNotFound { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_reschedule_respects_delay() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(3)).await.unwrap();
        queue.lease("t1", LEASE).await.unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::milliseconds(200);
        queue.reschedule(&job_id, "t1", "boom", later).await.unwrap();
        assert!(queue.lease("t2", LEASE).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let again = queue.lease("t2", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_expired_lease_reclaimed() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(1)).await.unwrap();
        queue
            .lease("crashed", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.lease("next", LEASE).await.unwrap().is_none());

        let record = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("lease expired"));
        assert_eq!(record.log.len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_enqueue_is_idempotent() {
        let queue = test_queue().await;
        let record = job(3);
        queue.enqueue(record.clone()).await.unwrap();
        queue.enqueue(record).await.unwrap();

        assert!(queue.lease("a", LEASE).await.unwrap().is_some());
        assert!(queue.lease("b", LEASE).await.unwrap().is_none());
        assert!(queue.health_check().await.is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_priority_order() {
        let queue = test_queue().await;
        let mut low = job(3);
        low.priority = 10;
        let mut high = job(3);
        high.priority = 1;
        let low_id = queue.enqueue(low).await.unwrap();
        let high_id = queue.enqueue(high).await.unwrap();
        let plain_id = queue.enqueue(job(3)).await.unwrap();

        let first = queue.lease("a", LEASE).await.unwrap().unwrap();
        let second = queue.lease("b", LEASE).await.unwrap().unwrap();
        let third = queue.lease("c", LEASE).await.unwrap().unwrap();
        assert_eq!([first.id, second.id, third.id], [plain_id, high_id, low_id]);
        assert_eq!(second.priority, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_retention_trims_completed() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = BrokerConfig {
            key_prefix: format!("jobsmith-test-{}", uuid::Uuid::new_v4()),
            keep_completed: 1,
            ..BrokerConfig::redis(url)
        };
        let queue = RedisQueue::connect(&config, "jobs").await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let job_id = queue.enqueue(job(1)).await.unwrap();
            queue.lease("t", LEASE).await.unwrap().unwrap();
            queue.complete(&job_id, "t", json!(null)).await.unwrap();
            ids.push(job_id);
        }

        assert!(queue.get_job(&ids[0]).await.unwrap().is_none());
        assert!(queue.get_job(&ids[1]).await.unwrap().is_some());
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_extend_lease() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(3)).await.unwrap();
        let short = Duration::from_millis(100);
        queue.lease("holder", short).await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.extend_lease(&job_id, "holder", short).await.unwrap();
        }
        assert!(queue.lease("other", LEASE).await.unwrap().is_none());

        let err = queue.extend_lease(&job_id, "other", LEASE).await.unwrap_err();
        assert!(matches!(err, WorkerError::LeaseLost { .. }));
        queue.complete(&job_id, "holder", json!(1)).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_expired_lease_without_record_is_dropped() {
        let queue = test_queue().await;
        let job_id = queue.enqueue(job(3)).await.unwrap();
        queue
            .lease("crashed", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        let mut conn = queue.conn.clone();
        let _: i64 = conn.del(queue.job_key(&job_id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(queue.lease("next", LEASE).await.unwrap().is_none());
        let exists: bool = conn.exists(queue.job_key(&job_id)).await.unwrap();
        assert!(!exists);
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting + counts.active + counts.failed, 0);
    }
}
