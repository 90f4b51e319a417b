//! Queue backends and the client that wraps them.
//!
//! A [`QueueBackend`] is a broker: it stores job records and performs the raw
//! state transitions atomically. [`QueueClient`] is the only thing the rest of
//! the crate talks to; it applies defaults, validates enqueues, decides
//! retries and retries failed broker calls.
//!
//! - **In-Memory**: single process, lost on restart, used for development and tests
//! - **Redis**: durable, shared between processes, the production broker
//!
//! # Examples
//!
//! ```rust,no_run
//! use jobsmith::config::JobsmithConfig;
//! use jobsmith::queue::{QueueBackend, QueueFactory};
//!
//! # async fn example() -> jobsmith::WorkerResult<()> {
//! let config = JobsmithConfig::load()?;
//! let backend = QueueFactory::from_config(&config).await?;
//! backend.health_check().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{BackendKind, JobsmithConfig};
use crate::error::WorkerResult;
use crate::job::{JobCounts, JobId, JobRecord, LogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub mod client;
pub mod memory;

pub use client::{LeasedJob, QueueClient};
pub use memory::InMemoryQueue;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use self::redis::RedisQueue;

/// Trait that all brokers must implement.
///
/// Every call that changes a job must be durably applied before it returns.
/// Calls that act on a leased job take the lease token and fail with
/// [`WorkerError::LeaseLost`](crate::error::WorkerError::LeaseLost) if the
/// token is no longer current. `complete`, `reschedule` and `fail` append
/// their log line ([`LogEntry::completed`], [`LogEntry::failed`]) in the same
/// atomic step as the state change, so the log never shows a transition that
/// did not happen.
///
/// Brokers keep only the most recent `keep_completed` completed and
/// `keep_failed` failed jobs; older terminal jobs are deleted with their log.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new `waiting` job. Storing the same id twice is a no-op.
    async fn enqueue(&self, job: JobRecord) -> WorkerResult<JobId>;

    /// Lease the next eligible job.
    ///
    /// Reclaims expired leases first, then picks the `waiting` job with the
    /// lowest priority value among those whose `available_at` has passed
    /// (oldest first on ties), marks it `active`, increments `attempts_made`
    /// and records `token`. Returns `None` when nothing is eligible.
    ///
    /// Not idempotent: callers must not retry a lease whose outcome is unknown.
    async fn lease(&self, token: &str, lease_timeout: Duration) -> WorkerResult<Option<JobRecord>>;

    /// Push the lease expiry of a job held under `token` to now plus `lease_timeout`.
    async fn extend_lease(
        &self,
        job_id: &str,
        token: &str,
        lease_timeout: Duration,
    ) -> WorkerResult<()>;

    /// Mark a leased job `completed` with its result.
    async fn complete(
        &self,
        job_id: &str,
        token: &str,
        result: serde_json::Value,
    ) -> WorkerResult<()>;

    /// Return a leased job to `waiting`, eligible again at `available_at`.
    async fn reschedule(
        &self,
        job_id: &str,
        token: &str,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> WorkerResult<()>;

    /// Mark a leased job permanently `failed`.
    async fn fail(&self, job_id: &str, token: &str, error: &str) -> WorkerResult<()>;

    /// Append a line to a job's log.
    async fn append_log(&self, job_id: &str, entry: LogEntry) -> WorkerResult<()>;

    /// Fetch a job with its full log.
    async fn get_job(&self, job_id: &str) -> WorkerResult<Option<JobRecord>>;

    /// Number of jobs per state.
    async fn counts(&self) -> WorkerResult<JobCounts>;

    /// Check broker connectivity.
    async fn health_check(&self) -> WorkerResult<()>;
}

/// Factory methods for creating brokers
pub struct QueueFactory;

impl QueueFactory {
    /// Create an in-memory broker with the default retention
    pub fn in_memory() -> Arc<dyn QueueBackend> {
        Arc::new(InMemoryQueue::new())
    }

    /// Create a Redis broker for the configured queue
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(config: &JobsmithConfig) -> WorkerResult<Arc<dyn QueueBackend>> {
        let queue = RedisQueue::connect(&config.broker, &config.queue_name).await?;
        Ok(Arc::new(queue))
    }

    /// Create whichever broker the configuration names
    pub async fn from_config(config: &JobsmithConfig) -> WorkerResult<Arc<dyn QueueBackend>> {
        match config.broker.backend {
            BackendKind::Memory => Ok(Arc::new(InMemoryQueue::with_retention(
                config.broker.keep_completed,
                config.broker.keep_failed,
            ))),
            #[cfg(feature = "redis-queue")]
            BackendKind::Redis => Self::redis(config).await,
            #[cfg(not(feature = "redis-queue"))]
            BackendKind::Redis => Err(crate::error::WorkerError::config(
                "redis backend requested but the redis-queue feature is disabled",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_backend_basic_operations() {
        let queue = QueueFactory::in_memory();
        let job = JobRecord::new("email.send", json!({"to": "x@example.com"}), 3, 5000);

        let job_id = queue.enqueue(job).await.unwrap();

        let leased = queue
            .lease("slot-0:t1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, job_id);
        assert_eq!(leased.status, JobStatus::Active);
        assert_eq!(leased.attempts_made, 1);

        queue
            .complete(&job_id, "slot-0:t1", json!({"delivered": true}))
            .await
            .unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_factory_from_memory_config() {
        let config = JobsmithConfig::testing();
        let queue = QueueFactory::from_config(&config).await.unwrap();
        assert!(queue.health_check().await.is_ok());
    }
}
