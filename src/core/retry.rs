//! Failure classification and the fixed-delay retry decision.
//!
//! A job moves `waiting -> active` on lease. From `active` it ends
//! `completed`, goes back to `waiting` after its backoff delay, or ends
//! `failed`. Only a handler lookup miss is non-retryable; every other error
//! is retried until the job has been leased `max_attempts` times.

use crate::error::WorkerError;
use crate::job::JobRecord;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Another attempt may succeed
    Retryable,
    /// Another attempt cannot change the outcome
    NonRetryable,
}

/// Classify a dispatch error.
pub fn classify(error: &WorkerError) -> ErrorClass {
    match error {
        WorkerError::UnsupportedJobType { .. } => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

/// What happens to a job after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-offer the job once `available_at` has passed
    Retry {
        /// Earliest re-lease time
        available_at: DateTime<Utc>,
        /// The delay that was applied
        delay: Duration,
    },
    /// All attempts used up, fail permanently
    Exhausted,
}

/// Decide the next step for a job whose current attempt failed.
///
/// `attempts_made` already counts the failed attempt, since the broker
/// increments it at lease time.
pub fn decide(job: &JobRecord, now: DateTime<Utc>) -> RetryDecision {
    if !job.has_attempts_left() {
        return RetryDecision::Exhausted;
    }

    let delay = Duration::from_millis(job.backoff_delay_ms);
    let available_at = now + ChronoDuration::milliseconds(job.backoff_delay_ms as i64);
    RetryDecision::Retry {
        available_at,
        delay,
    }
}
