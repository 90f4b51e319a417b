//! Error types for jobsmith operations.

use thiserror::Error;

/// Result type used throughout jobsmith.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Main error type for jobsmith operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Missing or invalid setting, fatal at startup
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// The job's type has no registered handler
    #[error("Unsupported job type: {job_type}")]
    UnsupportedJobType {
        /// The type string carried by the job
        job_type: String,
    },

    /// A handler raised or returned an error
    #[error("{message}")]
    Handler {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The broker could not be reached or rejected a call
    #[error("Broker error: {message}")]
    Broker {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The caller no longer holds the lease on this job
    #[error("Lease on job {job_id} is no longer held")]
    LeaseLost {
        /// Job identifier
        job_id: String,
    },

    /// No job with this id exists
    #[error("Job {job_id} not found")]
    JobNotFound {
        /// Job identifier
        job_id: String,
    },

    /// Rejected at enqueue time
    #[error("Invalid job: {message}")]
    InvalidJob {
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis connection error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O error (listener bind, signals)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker pool is already running
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// The worker pool is not running
    #[error("Worker pool is not running")]
    NotRunning,
}

impl WorkerError {
    /// Create a handler error from a message
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler error wrapping an underlying error
    pub fn handler_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a broker error
    pub fn broker<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an enqueue validation error
    pub fn invalid_job(message: impl Into<String>) -> Self {
        Self::InvalidJob {
            message: message.into(),
        }
    }

    /// Whether retrying the same broker call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            #[cfg(feature = "redis-queue")]
            Self::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }
}
