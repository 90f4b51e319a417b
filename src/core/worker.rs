//! One execution slot of the worker pool.
//!
//! A slot loops lease → dispatch → report until shutdown is signalled. It
//! holds at most one job at a time, and always finishes the job it holds
//! before exiting. While a handler runs, the slot renews its lease every
//! half lease timeout.

use crate::core::context::JobContext;
use crate::core::registry::HandlerRegistry;
use crate::core::retry::{self, ErrorClass, RetryDecision};
use crate::error::{WorkerError, WorkerResult};
use crate::queue::{LeasedJob, QueueClient};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What happened to a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Handler succeeded, job acknowledged
    Completed,
    /// Handler failed, job re-offered after its backoff delay
    Retrying,
    /// Job permanently failed
    Failed,
    /// The broker rejected the report; the lease will expire and be reclaimed
    Unreported,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Slots currently running their loop
    pub active_slots: usize,
    /// Jobs currently being handled
    pub in_flight: usize,
    /// Highest `in_flight` seen since start
    pub peak_in_flight: usize,
    /// Attempts that ended completed
    pub completed: u64,
    /// Attempts that ended the job as failed
    pub failed: u64,
    /// Attempts that were rescheduled
    pub retried: u64,
}

/// Shared counters behind [`WorkerStats`].
#[derive(Debug, Default)]
pub struct WorkerCounters {
    active_slots: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl WorkerCounters {
    /// Read all counters.
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            active_slots: self.active_slots.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    fn begin_job(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn end_job(&self, outcome: AttemptOutcome) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let counter = match outcome {
            AttemptOutcome::Completed => &self.completed,
            AttemptOutcome::Retrying => &self.retried,
            AttemptOutcome::Failed => &self.failed,
            AttemptOutcome::Unreported => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A single execution slot
pub struct Worker {
    name: String,
    client: QueueClient,
    registry: HandlerRegistry,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    /// Create slot number `id`
    pub fn new(
        id: usize,
        client: QueueClient,
        registry: HandlerRegistry,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            name: format!("worker-{id}"),
            client,
            registry,
            counters,
        }
    }

    /// Slot name, used as the lease owner
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the slot loop until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.counters.active_slots.fetch_add(1, Ordering::SeqCst);
        debug!(worker = %self.name, "Slot started");

        loop {
            let leased = match self.client.lease(&self.name, &mut shutdown).await {
                Ok(Some(leased)) => leased,
                Ok(None) => break,
                Err(e) => {
                    error!(worker = %self.name, "Lease failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.client.poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            self.process(leased).await;
        }

        self.counters.active_slots.fetch_sub(1, Ordering::SeqCst);
        debug!(worker = %self.name, "Slot stopped");
    }

    /// Handle one leased job and report the outcome to the broker.
    pub async fn process(&self, leased: LeasedJob) -> AttemptOutcome {
        self.counters.begin_job();
        let started = Instant::now();

        let outcome = self.execute(&leased).await;
        let outcome = match self.report(&leased, outcome).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    worker = %self.name,
                    job_id = %leased.id(),
                    "Could not report job outcome, leaving it to lease expiry: {}",
                    e
                );
                AttemptOutcome::Unreported
            }
        };

        self.counters.end_job(outcome);
        debug!(
            worker = %self.name,
            job_id = %leased.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?outcome,
            "Attempt finished"
        );
        outcome
    }

    /// Run the handler in its own task so a panic surfaces as an error.
    async fn execute(&self, leased: &LeasedJob) -> WorkerResult<Value> {
        let registry = self.registry.clone();
        let job_type = leased.job.job_type.clone();
        let payload = leased.job.payload.clone();
        let ctx = JobContext::new(&leased.job, self.client.clone());

        debug!(
            worker = %self.name,
            job_id = %leased.id(),
            job_type = %job_type,
            attempt = leased.job.attempts_made,
            "Dispatching job"
        );

        let mut handle =
            tokio::spawn(async move { registry.dispatch(&job_type, payload, ctx).await });

        let period = (self.client.lease_timeout() / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewing = true;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = heartbeat.tick(), if renewing => {
                    if let Err(e) = self.client.extend_lease(leased).await {
                        warn!(
                            worker = %self.name,
                            job_id = %leased.id(),
                            "Could not renew lease: {}",
                            e
                        );
                        renewing = !matches!(
                            e,
                            WorkerError::LeaseLost { .. } | WorkerError::JobNotFound { .. }
                        );
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(join_error) => Err(WorkerError::handler(format!(
                "handler panicked: {join_error}"
            ))),
        }
    }

    async fn report(
        &self,
        leased: &LeasedJob,
        outcome: WorkerResult<Value>,
    ) -> WorkerResult<AttemptOutcome> {
        let job = &leased.job;

        match outcome {
            Ok(result) => {
                self.client.ack(leased, result).await?;
                info!(
                    worker = %self.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts_made,
                    "Job completed"
                );
                Ok(AttemptOutcome::Completed)
            }
            Err(e) => {
                let message = e.to_string();

                match retry::classify(&e) {
                    ErrorClass::NonRetryable => {
                        self.client.fail(leased, &message).await?;
                        error!(
                            worker = %self.name,
                            job_id = %job.id,
                            job_type = %job.job_type,
                            "Job failed without retry: {}",
                            message
                        );
                        Ok(AttemptOutcome::Failed)
                    }
                    ErrorClass::Retryable => match self.client.retry(leased, &message).await? {
                        RetryDecision::Retry { delay, .. } => {
                            warn!(
                                worker = %self.name,
                                job_id = %job.id,
                                attempt = job.attempts_made,
                                max_attempts = job.max_attempts,
                                retry_in_ms = delay.as_millis() as u64,
                                "Job attempt failed: {}",
                                message
                            );
                            Ok(AttemptOutcome::Retrying)
                        }
                        RetryDecision::Exhausted => {
                            error!(
                                worker = %self.name,
                                job_id = %job.id,
                                attempts = job.attempts_made,
                                "Job failed after final attempt: {}",
                                message
                            );
                            Ok(AttemptOutcome::Failed)
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsmithConfig;
    use crate::core::registry::{JobKind, handler_fn};
    use crate::job::{JobOptions, JobStatus};
    use crate::queue::InMemoryQueue;
    use serde_json::json;

    fn slot(registry: HandlerRegistry) -> (Worker, QueueClient, Arc<WorkerCounters>) {
        slot_with(registry, &JobsmithConfig::testing())
    }

    fn slot_with(
        registry: HandlerRegistry,
        config: &JobsmithConfig,
    ) -> (Worker, QueueClient, Arc<WorkerCounters>) {
        let client = QueueClient::new(Arc::new(InMemoryQueue::new()), config);
        let counters = Arc::new(WorkerCounters::default());
        let worker = Worker::new(0, client.clone(), registry, counters.clone());
        (worker, client, counters)
    }

    async fn lease(client: &QueueClient) -> LeasedJob {
        let (_tx, mut rx) = watch::channel(false);
        client.lease("worker-0", &mut rx).await.unwrap().unwrap()
    }

    fn echo_registry() -> HandlerRegistry {
        HandlerRegistry::standard().with_handler(
            JobKind::EmailSend,
            handler_fn(|payload, ctx| async move {
                ctx.log("Dispatching email notification.").await?;
                Ok::<_, WorkerError>(json!({ "delivered": true, "payload": payload }))
            }),
        )
    }

    #[tokio::test]
    async fn test_success_acknowledges_with_result() {
        let (worker, client, counters) = slot(echo_registry());
        let job_id = client
            .enqueue("email.send", json!({"to": "x@example.com"}), JobOptions::default())
            .await
            .unwrap();

        let outcome = worker.process(lease(&client).await).await;
        assert_eq!(outcome, AttemptOutcome::Completed);

        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(
            job.result,
            Some(json!({"delivered": true, "payload": {"to": "x@example.com"}}))
        );
        let lines: Vec<_> = job.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(lines, ["Dispatching email notification.", "Job completed."]);

        let stats = counters.snapshot();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_without_retry() {
        let (worker, client, counters) = slot(echo_registry());
        let job_id = client
            .enqueue("unknown.kind", json!({}), JobOptions::default())
            .await
            .unwrap();

        let outcome = worker.process(lease(&client).await).await;
        assert_eq!(outcome, AttemptOutcome::Failed);

        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.error.as_deref(), Some("Unsupported job type: unknown.kind"));
        assert_eq!(counters.snapshot().retried, 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_retried() {
        let registry = HandlerRegistry::standard().with_handler(
            JobKind::EmailSend,
            handler_fn(|_payload, _ctx| async { Err(WorkerError::handler("smtp down")) }),
        );
        let (worker, client, counters) = slot(registry);
        let job_id = client
            .enqueue("email.send", json!({}), JobOptions::default())
            .await
            .unwrap();

        let outcome = worker.process(lease(&client).await).await;
        assert_eq!(outcome, AttemptOutcome::Retrying);

        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.error.is_none());
        assert_eq!(job.log.last().unwrap().message, "Job failed: smtp down");
        assert_eq!(counters.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retryable() {
        let registry = HandlerRegistry::standard().with_handler(
            JobKind::AiMatch,
            handler_fn(|_payload, _ctx| async {
                if true {
                    panic!("model exploded");
                }
                Ok(Value::Null)
            }),
        );
        let (worker, client, _) = slot(registry);
        let job_id = client
            .enqueue("ai.match", json!({}), JobOptions::default())
            .await
            .unwrap();

        let outcome = worker.process(lease(&client).await).await;
        assert_eq!(outcome, AttemptOutcome::Retrying);

        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert!(job.log.last().unwrap().message.starts_with("Job failed: handler panicked"));
    }

    #[tokio::test]
    async fn test_lost_lease_leaves_no_outcome_line() {
        let (worker, client, counters) = slot(echo_registry());
        let job_id = client
            .enqueue("email.send", json!({}), JobOptions::default())
            .await
            .unwrap();
        let mut leased = lease(&client).await;
        leased.token = "worker-0:stale".to_string();

        let outcome = worker.process(leased).await;
        assert_eq!(outcome, AttemptOutcome::Unreported);

        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
        let lines: Vec<_> = job.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(lines, ["Dispatching email notification."]);
        assert_eq!(counters.snapshot().completed, 0);
    }

    #[tokio::test]
    async fn test_lost_lease_on_failure_leaves_no_outcome_line() {
        let registry = HandlerRegistry::standard().with_handler(
            JobKind::EmailSend,
            handler_fn(|_payload, _ctx| async { Err(WorkerError::handler("smtp down")) }),
        );
        let (worker, client, _) = slot(registry);
        let job_id = client
            .enqueue("email.send", json!({}), JobOptions::default())
            .await
            .unwrap();
        let mut leased = lease(&client).await;
        leased.token = "worker-0:stale".to_string();

        assert_eq!(worker.process(leased).await, AttemptOutcome::Unreported);
        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert!(job.log.is_empty());
    }

    #[tokio::test]
    async fn test_long_handler_keeps_its_lease() {
        let registry = HandlerRegistry::standard().with_handler(
            JobKind::AiMatch,
            handler_fn(|_payload, _ctx| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, WorkerError>(json!({ "matched": true }))
            }),
        );
        let mut config = JobsmithConfig::testing();
        config.broker.lease_timeout_ms = 100;
        let (worker, client, _) = slot_with(registry, &config);
        let job_id = client
            .enqueue("ai.match", json!({}), JobOptions::default())
            .await
            .unwrap();

        let running = tokio::spawn({
            let client = client.clone();
            async move {
                let leased = lease(&client).await;
                worker.process(leased).await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_tx, mut rx) = watch::channel(false);
        let rival = tokio::time::timeout(
            Duration::from_millis(50),
            client.lease("worker-1", &mut rx),
        )
        .await;
        assert!(rival.is_err(), "job was leased twice");

        assert_eq!(running.await.unwrap(), AttemptOutcome::Completed);
        let job = client.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let (worker, client, counters) = slot(echo_registry());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(worker.run(rx));
        let job_id = client
            .enqueue("email.send", json!({}), JobOptions::default())
            .await
            .unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let job = client.get_job(&job_id).await.unwrap().unwrap();
            if job.status == JobStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "job was never completed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(counters.snapshot().active_slots, 0);
    }
}
