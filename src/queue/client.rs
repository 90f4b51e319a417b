//! The queue client: the single entry point to the broker.
//!
//! Wraps a [`QueueBackend`] with enqueue defaults and validation, a blocking
//! lease loop, retry decisions and bounded retries of failed broker calls.

use super::QueueBackend;
use crate::config::{BrokerConfig, JobsmithConfig, RetryPolicy};
use crate::core::retry::{self, RetryDecision};
use crate::error::{WorkerError, WorkerResult};
use crate::job::{JobCounts, JobId, JobOptions, JobRecord, LogEntry, MAX_PRIORITY};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A job together with the lease that currently holds it.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The record as it was at lease time
    pub job: JobRecord,
    /// Proof of ownership, required by every follow-up call
    pub token: String,
}

impl LeasedJob {
    /// The leased job's id
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Client for a single named queue.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn QueueBackend>,
    queue_name: String,
    defaults: RetryPolicy,
    broker: BrokerConfig,
    poll_interval: Duration,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("queue_name", &self.queue_name)
            .field("defaults", &self.defaults)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl QueueClient {
    /// Wrap a broker using the given configuration.
    pub fn new(backend: Arc<dyn QueueBackend>, config: &JobsmithConfig) -> Self {
        Self {
            backend,
            queue_name: config.queue_name.clone(),
            defaults: config.retry.clone(),
            broker: config.broker.clone(),
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms),
        }
    }

    /// Name of the queue this client serves
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Default retry policy applied to new jobs
    pub fn defaults(&self) -> &RetryPolicy {
        &self.defaults
    }

    /// How long an idle lease waits between broker polls
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// How long a lease lasts without renewal
    pub fn lease_timeout(&self) -> Duration {
        self.broker.lease_timeout()
    }

    /// Submit a job.
    ///
    /// A `null` payload is stored as an empty object; any other non-object
    /// payload is rejected. The type is not checked against the handler
    /// registry here: a job of unknown type is accepted and fails when it is
    /// leased.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> WorkerResult<JobId> {
        if job_type.trim().is_empty() {
            return Err(WorkerError::invalid_job("job type must not be empty"));
        }

        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(WorkerError::invalid_job("payload must be a JSON object")),
        };

        let max_attempts = options.max_attempts.unwrap_or(self.defaults.max_attempts);
        if max_attempts == 0 {
            return Err(WorkerError::invalid_job("max attempts must be at least 1"));
        }
        let backoff_delay_ms = options
            .backoff_delay_ms
            .unwrap_or(self.defaults.backoff_delay_ms);
        if backoff_delay_ms == 0 {
            return Err(WorkerError::invalid_job("backoff delay must be at least 1 ms"));
        }

        let priority = options.priority.unwrap_or(0);
        if priority > MAX_PRIORITY {
            return Err(WorkerError::invalid_job(format!(
                "priority must be between 0 and {MAX_PRIORITY}"
            )));
        }

        let mut job = JobRecord::new(job_type, payload, max_attempts, backoff_delay_ms);
        job.priority = priority;
        if let Some(delay_ms) = options.delay_ms {
            job.available_at = job.created_at + millis(delay_ms);
        }

        let backend = &self.backend;
        let job_id = self
            .with_retry("enqueue", || backend.enqueue(job.clone()))
            .await?;

        info!(
            job_id = %job_id,
            job_type,
            queue = %self.queue_name,
            max_attempts,
            "Enqueued job"
        );
        Ok(job_id)
    }

    /// Wait for the next eligible job.
    ///
    /// Polls the broker every poll interval until a job is leased or
    /// `shutdown` flips to `true`, in which case `None` is returned.
    ///
    /// A failed lease call is not retried here: the broker may have leased
    /// the job before the error surfaced, and a second call would lease
    /// another one. The caller polls again instead.
    pub async fn lease(
        &self,
        worker_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WorkerResult<Option<LeasedJob>> {
        let lease_timeout = self.broker.lease_timeout();

        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            let token = format!("{worker_id}:{}", Uuid::new_v4());
            let timeout = Duration::from_millis(self.broker.operation_timeout_ms);
            let leased = tokio::time::timeout(timeout, self.backend.lease(&token, lease_timeout))
                .await
                .map_err(|elapsed| WorkerError::broker("lease timed out", elapsed))??;

            if let Some(job) = leased {
                debug!(job_id = %job.id, worker_id, attempt = job.attempts_made, "Leased job");
                return Ok(Some(LeasedJob { job, token }));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Push back the lease expiry of a job that is still running.
    pub async fn extend_lease(&self, leased: &LeasedJob) -> WorkerResult<()> {
        let backend = &self.backend;
        let lease_timeout = self.broker.lease_timeout();
        let (id, token) = (leased.id(), leased.token.as_str());
        self.with_retry("extend_lease", move || {
            backend.extend_lease(id, token, lease_timeout)
        })
        .await
    }

    /// Mark a leased job completed with its result.
    pub async fn ack(&self, leased: &LeasedJob, result: Value) -> WorkerResult<()> {
        let backend = &self.backend;
        let (id, token) = (leased.id(), leased.token.as_str());
        self.with_retry("ack", move || backend.complete(id, token, result.clone()))
            .await
    }

    /// Record a retryable failure.
    ///
    /// Re-offers the job after its fixed backoff delay if it has attempts
    /// left, otherwise fails it permanently with `error`.
    pub async fn retry(&self, leased: &LeasedJob, error: &str) -> WorkerResult<RetryDecision> {
        let decision = retry::decide(&leased.job, Utc::now());
        let backend = &self.backend;
        let (id, token) = (leased.id(), leased.token.as_str());

        match decision {
            RetryDecision::Retry { available_at, .. } => {
                self.with_retry("retry", move || {
                    backend.reschedule(id, token, error, available_at)
                })
                .await?;
            }
            RetryDecision::Exhausted => {
                self.with_retry("fail", move || backend.fail(id, token, error))
                    .await?;
            }
        }
        Ok(decision)
    }

    /// Fail a leased job permanently, skipping any remaining attempts.
    pub async fn fail(&self, leased: &LeasedJob, error: &str) -> WorkerResult<()> {
        let backend = &self.backend;
        let (id, token) = (leased.id(), leased.token.as_str());
        self.with_retry("fail", move || backend.fail(id, token, error))
            .await
    }

    /// Append a timestamped line to a job's log.
    pub async fn append_log(&self, job_id: &str, message: &str) -> WorkerResult<()> {
        let entry = LogEntry::now(message);
        let backend = &self.backend;
        self.with_retry("append_log", move || {
            backend.append_log(job_id, entry.clone())
        })
        .await
    }

    /// Fetch a job with its log.
    pub async fn get_job(&self, job_id: &str) -> WorkerResult<Option<JobRecord>> {
        let backend = &self.backend;
        self.with_retry("get_job", move || backend.get_job(job_id))
            .await
    }

    /// Number of jobs per state.
    pub async fn counts(&self) -> WorkerResult<JobCounts> {
        let backend = &self.backend;
        self.with_retry("counts", move || backend.counts()).await
    }

    /// Check broker connectivity, without retrying.
    pub async fn health_check(&self) -> WorkerResult<()> {
        self.backend.health_check().await
    }

    /// Run a broker call, retrying transient failures and timeouts.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> WorkerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let timeout = Duration::from_millis(self.broker.operation_timeout_ms);
        let delay = Duration::from_millis(self.broker.retry_delay_ms);
        let mut attempt = 0u32;

        loop {
            let error = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => e,
                Err(elapsed) => WorkerError::broker(format!("{operation} timed out"), elapsed),
            };

            if attempt >= self.broker.retry_attempts {
                return Err(error);
            }
            attempt += 1;
            warn!(
                operation,
                attempt,
                max = self.broker.retry_attempts,
                "Broker call failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn millis(ms: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
