//! The worker engine and its facade.
//!
//! [`Jobsmith`] ties together the configuration, the queue client, the
//! handler registry and the worker pool. It is the type applications hold:
//! producers call [`Jobsmith::enqueue`], the process calls
//! [`Jobsmith::start`] and [`Jobsmith::stop`], and operators read jobs back
//! with [`Jobsmith::get_job`].

use crate::config::JobsmithConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::job::{JobCounts, JobId, JobOptions, JobRecord};
use crate::queue::{QueueBackend, QueueClient, QueueFactory};
use serde_json::Value;
use std::sync::Arc;

pub mod context;
pub mod engine;
pub mod registry;
pub mod retry;
pub mod worker;

pub use context::{JobContext, JobLogger};
pub use engine::WorkerPool;
pub use registry::{HandlerRegistry, JobHandler, JobKind, handler_fn};
pub use retry::{ErrorClass, RetryDecision};
pub use worker::{AttemptOutcome, Worker, WorkerStats};

/// The background job worker.
///
/// # Examples
///
/// ```rust
/// use jobsmith::prelude::*;
/// use serde_json::json;
///
/// # async fn example() -> WorkerResult<()> {
/// let jobsmith = Jobsmith::connect(JobsmithConfig::development(), HandlerRegistry::standard()).await?;
/// jobsmith.start().await?;
///
/// let job_id = jobsmith
///     .enqueue("email.send", json!({"to": "x@example.com"}), JobOptions::default())
///     .await?;
/// println!("queued {job_id}");
///
/// jobsmith.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Jobsmith {
    config: Arc<JobsmithConfig>,
    client: QueueClient,
    registry: HandlerRegistry,
    pool: WorkerPool,
}

impl std::fmt::Debug for Jobsmith {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobsmith")
            .field("queue", &self.config.queue_name)
            .field("concurrency", &self.pool.concurrency())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Jobsmith {
    /// Build on an existing broker.
    ///
    /// Fails with [`WorkerError::Config`] if the configuration does not
    /// validate.
    pub fn new(
        config: JobsmithConfig,
        backend: Arc<dyn QueueBackend>,
        registry: HandlerRegistry,
    ) -> WorkerResult<Self> {
        config
            .validate()
            .map_err(|errors| WorkerError::config(errors.join("; ")))?;

        let client = QueueClient::new(backend, &config);
        let pool = WorkerPool::new(client.clone(), registry.clone(), config.workers.concurrency);

        Ok(Self {
            config: Arc::new(config),
            client,
            registry,
            pool,
        })
    }

    /// Connect to the broker named by the configuration.
    pub async fn connect(config: JobsmithConfig, registry: HandlerRegistry) -> WorkerResult<Self> {
        let backend = QueueFactory::from_config(&config).await?;
        Self::new(config, backend, registry)
    }

    /// Start the worker pool.
    pub async fn start(&self) -> WorkerResult<()> {
        self.pool.start().await?;
        tracing::info!(
            queue = %self.config.queue_name,
            types = ?self.registry.types(),
            "Jobsmith started"
        );
        Ok(())
    }

    /// Stop leasing and wait for in-flight jobs to finish.
    pub async fn stop(&self) -> WorkerResult<()> {
        self.pool.stop().await?;
        tracing::info!(queue = %self.config.queue_name, "Jobsmith stopped");
        Ok(())
    }

    /// Submit a job to the queue.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> WorkerResult<JobId> {
        self.client.enqueue(job_type, payload, options).await
    }

    /// Fetch a job with its log.
    pub async fn get_job(&self, job_id: &str) -> WorkerResult<Option<JobRecord>> {
        self.client.get_job(job_id).await
    }

    /// Number of jobs per state.
    pub async fn counts(&self) -> WorkerResult<JobCounts> {
        self.client.counts().await
    }

    /// Whether the pool is running.
    pub async fn is_running(&self) -> bool {
        self.pool.is_running().await
    }

    /// Pool activity counters.
    pub fn stats(&self) -> WorkerStats {
        self.pool.stats()
    }

    /// The queue client.
    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    /// The handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// The resolved configuration.
    pub fn config(&self) -> &JobsmithConfig {
        &self.config
    }
}
