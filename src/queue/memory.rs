//! In-memory broker.
//!
//! Stores every job in process memory behind a single async lock, so each
//! transition is atomic with respect to concurrent slots. Nothing survives a
//! restart; use it for development, tests and single-process demos.

use super::QueueBackend;
use crate::config::BrokerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::job::{JobCounts, JobId, JobRecord, JobStatus, LogEntry};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    /// Job storage indexed by id
    jobs: HashMap<JobId, JobRecord>,
    /// Waiting jobs in enqueue order
    waiting: VecDeque<JobId>,
    /// Active jobs with their lease expiry
    leases: HashMap<JobId, DateTime<Utc>>,
    /// Completed jobs, oldest first
    completed: VecDeque<JobId>,
    /// Failed jobs, oldest first
    failed: VecDeque<JobId>,
    keep_completed: usize,
    keep_failed: usize,
}

impl MemoryState {
    /// Return jobs whose lease has expired to `waiting`, or fail them if
    /// they have no attempts left.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in expired {
            self.leases.remove(&job_id);
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };

            job.lease_token = None;
            job.updated_at = now;
            if job.has_attempts_left() {
                job.status = JobStatus::Waiting;
                job.available_at = now;
                self.waiting.push_back(job_id.clone());
                tracing::warn!(job_id = %job_id, "Lease expired, job returned to waiting");
            } else {
                job.status = JobStatus::Failed;
                job.error = Some("lease expired".to_string());
                job.finished_at = Some(now);
                job.log.push(LogEntry::failed("lease expired"));
                tracing::error!(job_id = %job_id, "Lease expired on final attempt, job failed");
                self.retire(job_id, JobStatus::Failed);
            }
        }
    }

    /// Position in `waiting` of the next job to lease.
    fn next_ready(&self, now: DateTime<Utc>) -> Option<usize> {
        self.waiting
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                let job = self.jobs.get(id)?;
                (job.available_at <= now).then_some((job.priority, index))
            })
            .min()
            .map(|(_, index)| index)
    }

    /// Look up an active job held under `token`.
    fn leased_mut(&mut self, job_id: &str, token: &str) -> WorkerResult<&mut JobRecord> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| WorkerError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        if job.status != JobStatus::Active || job.lease_token.as_deref() != Some(token) {
            return Err(WorkerError::LeaseLost {
                job_id: job_id.to_string(),
            });
        }
        Ok(job)
    }

    /// Record a terminal job and delete the oldest ones past the retention cap.
    fn retire(&mut self, job_id: JobId, status: JobStatus) {
        let (finished, keep) = match status {
            JobStatus::Completed => (&mut self.completed, self.keep_completed),
            JobStatus::Failed => (&mut self.failed, self.keep_failed),
            _ => return,
        };

        finished.push_back(job_id);
        while finished.len() > keep {
            if let Some(old) = finished.pop_front() {
                self.jobs.remove(&old);
                tracing::debug!(job_id = %old, status = %status, "Removed job past retention");
            }
        }
    }
}

/// In-memory broker implementation
#[derive(Debug)]
pub struct InMemoryQueue {
    state: RwLock<MemoryState>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Create an empty broker with the default retention
    pub fn new() -> Self {
        let broker = BrokerConfig::default();
        Self::with_retention(broker.keep_completed, broker.keep_failed)
    }

    /// Create an empty broker that keeps at most `keep_completed` completed
    /// and `keep_failed` failed jobs
    pub fn with_retention(keep_completed: usize, keep_failed: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                keep_completed,
                keep_failed,
                ..Default::default()
            }),
        }
    }

    /// Number of stored jobs in any state
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    /// Whether no jobs are stored
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, mut job: JobRecord) -> WorkerResult<JobId> {
        let mut state = self.state.write().await;
        let job_id = job.id.clone();

        if state.jobs.contains_key(&job_id) {
            return Ok(job_id);
        }

        job.status = JobStatus::Waiting;
        job.lease_token = None;
        state.waiting.push_back(job_id.clone());
        state.jobs.insert(job_id.clone(), job);

        tracing::debug!(job_id = %job_id, "Stored job");
        Ok(job_id)
    }

    async fn lease(&self, token: &str, lease_timeout: Duration) -> WorkerResult<Option<JobRecord>> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.reclaim_expired(now);

        let Some(index) = state.next_ready(now) else {
            return Ok(None);
        };
        let Some(job_id) = state.waiting.remove(index) else {
            return Ok(None);
        };

        let expires_at = now + lease_span(lease_timeout)?;
        state.leases.insert(job_id.clone(), expires_at);

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WorkerError::JobNotFound {
                job_id: job_id.clone(),
            })?;
        job.status = JobStatus::Active;
        job.attempts_made += 1;
        job.lease_token = Some(token.to_string());
        job.updated_at = now;

        tracing::debug!(job_id = %job_id, attempt = job.attempts_made, "Leased job");
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: &str,
        token: &str,
        lease_timeout: Duration,
    ) -> WorkerResult<()> {
        let expires_at = Utc::now() + lease_span(lease_timeout)?;
        let mut state = self.state.write().await;

        state.leased_mut(job_id, token)?;
        state.leases.insert(job_id.to_string(), expires_at);
        Ok(())
    }

    async fn complete(
        &self,
        job_id: &str,
        token: &str,
        result: serde_json::Value,
    ) -> WorkerResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let job = state.leased_mut(job_id, token)?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.lease_token = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        job.log.push(LogEntry::completed());
        state.leases.remove(job_id);
        state.retire(job_id.to_string(), JobStatus::Completed);

        tracing::debug!(job_id = %job_id, "Completed job");
        Ok(())
    }

    async fn reschedule(
        &self,
        job_id: &str,
        token: &str,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let job = state.leased_mut(job_id, token)?;
        job.status = JobStatus::Waiting;
        job.lease_token = None;
        job.available_at = available_at;
        job.updated_at = now;
        job.log.push(LogEntry::failed(error));
        let attempts_made = job.attempts_made;
        let max_attempts = job.max_attempts;

        state.leases.remove(job_id);
        state.waiting.push_back(job_id.to_string());

        tracing::warn!(
            job_id = %job_id,
            attempt = attempts_made,
            max_attempts,
            "Job failed, rescheduled: {}",
            error
        );
        Ok(())
    }

    async fn fail(&self, job_id: &str, token: &str, error: &str) -> WorkerResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let job = state.leased_mut(job_id, token)?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.lease_token = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        job.log.push(LogEntry::failed(error));
        state.leases.remove(job_id);
        state.retire(job_id.to_string(), JobStatus::Failed);

        tracing::debug!(job_id = %job_id, "Failed job");
        Ok(())
    }

    async fn append_log(&self, job_id: &str, entry: LogEntry) -> WorkerResult<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| WorkerError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        job.log.push(entry);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> WorkerResult<Option<JobRecord>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn counts(&self) -> WorkerResult<JobCounts> {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut counts = JobCounts::default();

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting if job.available_at > now => counts.delayed += 1,
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn health_check(&self) -> WorkerResult<()> {
        Ok(())
    }
}

fn lease_span(lease_timeout: Duration) -> WorkerResult<ChronoDuration> {
    ChronoDuration::from_std(lease_timeout)
        .map_err(|e| WorkerError::config(format!("invalid lease timeout: {e}")))
}
