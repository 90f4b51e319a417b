//! What a handler sees about the job it is running.

use crate::error::WorkerResult;
use crate::job::{JobId, JobRecord};
use crate::queue::QueueClient;
use tracing::info;

/// Appends progress lines to one job's log.
///
/// Lines are written to the broker as they are produced and are never
/// removed, so they stay visible across retries and after the job ends.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    job_type: String,
    client: QueueClient,
}

impl JobLogger {
    pub(crate) fn new(job_id: JobId, job_type: String, client: QueueClient) -> Self {
        Self {
            job_id,
            job_type,
            client,
        }
    }

    /// Append a timestamped line to the job's log.
    pub async fn log(&self, message: impl AsRef<str>) -> WorkerResult<()> {
        let message = message.as_ref();
        info!(job_id = %self.job_id, job_type = %self.job_type, "{}", message);
        self.client.append_log(&self.job_id, message).await
    }
}

/// Identity of the running job plus its [`JobLogger`].
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Id of the job being processed
    pub job_id: JobId,
    /// Type string of the job
    pub job_type: String,
    /// Attempt number of this run, starting at 1
    pub attempts_made: u32,
    /// Attempt ceiling for the job
    pub max_attempts: u32,
    logger: JobLogger,
}

impl JobContext {
    pub(crate) fn new(job: &JobRecord, client: QueueClient) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            logger: JobLogger::new(job.id.clone(), job.job_type.clone(), client),
        }
    }

    /// The job's logger
    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Shorthand for `self.logger().log(message)`.
    pub async fn log(&self, message: impl AsRef<str>) -> WorkerResult<()> {
        self.logger.log(message).await
    }

    /// Whether this run is the job's last permitted attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}
