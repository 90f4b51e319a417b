//! The Job Record and the values that travel with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a job
pub type JobId = String;

/// Largest accepted priority value.
pub const MAX_PRIORITY: u32 = 2_097_152;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased (possibly not yet eligible because of a delay)
    Waiting,
    /// Leased by a worker slot
    Active,
    /// Handler succeeded
    Completed,
    /// Permanently failed
    Failed,
}

impl JobStatus {
    /// Lowercase name, as stored by the broker.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// One timestamped line of a job's progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// When the line was appended
    pub at: DateTime<Utc>,
    /// The line itself
    pub message: String,
}

impl LogEntry {
    /// Stamp a message with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            message: message.into(),
        }
    }

    /// Line recorded when a job is acknowledged.
    pub fn completed() -> Self {
        Self::now("Job completed.")
    }

    /// Line recorded when an attempt fails.
    pub fn failed(error: &str) -> Self {
        Self::now(format!("Job failed: {error}"))
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.to_rfc3339(), self.message)
    }
}

/// The unit of work, as held by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique job identifier, fixed at enqueue
    pub id: JobId,
    /// Name of the handler that processes this job
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload, interpreted only by the handler
    pub payload: serde_json::Value,
    /// Current status
    pub status: JobStatus,
    /// Number of times the job has been leased
    pub attempts_made: u32,
    /// Ceiling on `attempts_made`
    pub max_attempts: u32,
    /// Fixed wait before a failed attempt is re-offered (in milliseconds)
    pub backoff_delay_ms: u64,
    /// Lease order among eligible jobs; lower goes first, 0 is unprioritized
    #[serde(default)]
    pub priority: u32,
    /// Progress log, accumulated across attempts
    #[serde(default)]
    pub log: Vec<LogEntry>,
    /// Handler return value, set once completed
    pub result: Option<serde_json::Value>,
    /// Final error, set once failed
    pub error: Option<String>,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// When the job last changed state
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be leased
    pub available_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Token of the lease currently held on this job
    #[serde(skip)]
    pub lease_token: Option<String>,
}

impl JobRecord {
    /// Build a fresh `waiting` record.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        backoff_delay_ms: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts,
            backoff_delay_ms,
            priority: 0,
            log: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            available_at: now,
            finished_at: None,
            lease_token: None,
        }
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// Per-job overrides accepted at enqueue time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Override the default attempt ceiling
    pub max_attempts: Option<u32>,
    /// Override the default fixed backoff (in milliseconds)
    pub backoff_delay_ms: Option<u64>,
    /// Delay before the job first becomes eligible (in milliseconds)
    pub delay_ms: Option<u64>,
    /// Lease order among eligible jobs (lower first)
    pub priority: Option<u32>,
}

impl JobOptions {
    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the fixed backoff.
    pub fn with_backoff(mut self, backoff_delay_ms: u64) -> Self {
        self.backoff_delay_ms = Some(backoff_delay_ms);
        self
    }

    /// Delay first eligibility.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Set the lease priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    /// Waiting and eligible now
    pub waiting: u64,
    /// Waiting but not yet eligible (delayed or backing off)
    pub delayed: u64,
    /// Leased
    pub active: u64,
    /// Completed
    pub completed: u64,
    /// Permanently failed
    pub failed: u64,
}
