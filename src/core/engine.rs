//! The worker pool: starts and stops the execution slots.
//!
//! The pool spawns exactly `concurrency` slots, each a tokio task running
//! [`Worker::run`]. Stopping flips a shared watch channel; slots stop
//! leasing, finish the job they hold and exit, and `stop` waits for all of
//! them.

use crate::core::registry::HandlerRegistry;
use crate::core::worker::{Worker, WorkerCounters, WorkerStats};
use crate::error::{WorkerError, WorkerResult};
use crate::queue::QueueClient;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

struct RunningPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    started_at: Instant,
}

/// Fixed-size pool of execution slots
pub struct WorkerPool {
    client: QueueClient,
    registry: HandlerRegistry,
    concurrency: usize,
    counters: Arc<WorkerCounters>,
    running: Mutex<Option<RunningPool>>,
}

impl WorkerPool {
    /// Create a stopped pool of `concurrency` slots
    pub fn new(client: QueueClient, registry: HandlerRegistry, concurrency: usize) -> Self {
        Self {
            client,
            registry,
            concurrency,
            counters: Arc::new(WorkerCounters::default()),
            running: Mutex::new(None),
        }
    }

    /// Number of slots the pool runs
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn the slots and begin leasing.
    pub async fn start(&self) -> WorkerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }
        if self.concurrency == 0 {
            return Err(WorkerError::config("Concurrency must be greater than 0"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..self.concurrency)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    self.client.clone(),
                    self.registry.clone(),
                    Arc::clone(&self.counters),
                );
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        *running = Some(RunningPool {
            shutdown_tx,
            handles,
            started_at: Instant::now(),
        });

        tracing::info!(
            queue = %self.client.queue_name(),
            concurrency = self.concurrency,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop leasing and wait for every slot to finish its current job.
    pub async fn stop(&self) -> WorkerResult<()> {
        let pool = self
            .running
            .lock()
            .await
            .take()
            .ok_or(WorkerError::NotRunning)?;

        tracing::info!(
            in_flight = self.counters.snapshot().in_flight,
            "Stopping worker pool, draining in-flight jobs"
        );
        // Every receiver may already be gone if all slots exited early.
        let _ = pool.shutdown_tx.send(true);

        let mut failures = 0usize;
        for (id, result) in join_all(pool.handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                failures += 1;
                tracing::error!(worker = id, "Slot ended abnormally: {}", e);
            }
        }

        tracing::info!(
            uptime_secs = pool.started_at.elapsed().as_secs(),
            failures,
            "Worker pool stopped"
        );
        Ok(())
    }

    /// Whether the slots are running
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Current activity counters
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}
