//! Configuration types for jobsmith.
//!
//! Configuration is resolved once at startup into an immutable
//! [`JobsmithConfig`] and passed explicitly to the queue client, the worker
//! pool and the HTTP endpoint. Values come from the environment (see
//! [`JobsmithConfig::from_env`]); every key is optional.

use crate::error::{WorkerError, WorkerResult};
use config::{Config, Environment, Map};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a jobsmith process.
///
/// # Examples
///
/// ```rust
/// use jobsmith::config::{JobsmithConfig, WorkerConfig};
///
/// let config = JobsmithConfig {
///     workers: WorkerConfig::with_concurrency(8),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsmithConfig {
    /// Logical queue this process consumes
    pub queue_name: String,

    /// Broker connection settings
    pub broker: BrokerConfig,

    /// Worker pool settings
    pub workers: WorkerConfig,

    /// Default retry policy applied at enqueue time
    pub retry: RetryPolicy,

    /// Health/admin endpoint settings
    pub server: ServerConfig,

    /// Process diagnostics
    pub logging: LoggingConfig,
}

impl Default for JobsmithConfig {
    fn default() -> Self {
        Self {
            queue_name: "jobs".to_string(),
            broker: BrokerConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which broker implementation backs the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Durable Redis broker
    Redis,
    /// In-process broker, lost on restart
    Memory,
}

impl FromStr for BackendKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(WorkerError::config(format!(
                "unknown queue backend '{other}' (expected 'redis' or 'memory')"
            ))),
        }
    }
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker implementation
    pub backend: BackendKind,

    /// Connection string (e.g., "redis://localhost:6379")
    pub url: String,

    /// Key prefix for broker keys
    pub key_prefix: String,

    /// How long a lease stays valid before the broker reclaims the job (in milliseconds)
    pub lease_timeout_ms: u64,

    /// Timeout for a single broker call (in milliseconds)
    pub operation_timeout_ms: u64,

    /// How many times a failed broker call is retried
    pub retry_attempts: u32,

    /// Wait between broker call retries (in milliseconds)
    pub retry_delay_ms: u64,

    /// Most recent completed jobs kept; older ones are deleted
    pub keep_completed: usize,

    /// Most recent failed jobs kept; older ones are deleted
    pub keep_failed: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "jobsmith".to_string(),
            lease_timeout_ms: 30_000,
            operation_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 250,
            keep_completed: 1000,
            keep_failed: 5000,
        }
    }
}

impl BrokerConfig {
    /// Configuration for the in-process broker.
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Default::default()
        }
    }

    /// Configuration for a Redis broker at `url`.
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Redis,
            url: url.into(),
            ..Default::default()
        }
    }

    /// Lease validity as a duration.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of parallel execution slots
    pub concurrency: usize,

    /// How long an idle slot waits before polling the broker again (in milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific number of slots.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }
}

/// Retry policy configuration.
///
/// The delay between attempts is fixed; it does not grow with the attempt
/// number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default ceiling on attempts per job
    pub max_attempts: u32,

    /// Default fixed delay before a failed job is re-offered (in milliseconds)
    pub backoff_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with the given ceiling and delay.
    pub fn fixed(max_attempts: u32, backoff_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_delay_ms,
        }
    }
}

/// Health/admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Token required on the admin routes (open if unset)
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4001,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "fatal" => Ok(LogLevel::Error),
            other => Err(WorkerError::config(format!("unknown log level '{other}'"))),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Raw environment values. Keys are the lowercased variable names.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default)]
    worker_queue_backend: Option<String>,
    #[serde(default)]
    worker_key_prefix: Option<String>,
    #[serde(default)]
    worker_lease_timeout_ms: Option<u64>,
    #[serde(default)]
    worker_keep_completed: Option<usize>,
    #[serde(default)]
    worker_keep_failed: Option<usize>,
    #[serde(default)]
    worker_host: Option<String>,
    #[serde(default)]
    worker_port: Option<u16>,
    #[serde(default)]
    worker_queue_name: Option<String>,
    #[serde(default)]
    worker_concurrency: Option<usize>,
    #[serde(default)]
    worker_poll_interval_ms: Option<u64>,
    #[serde(default)]
    worker_job_attempts: Option<u32>,
    #[serde(default)]
    worker_job_backoff_ms: Option<u64>,
    #[serde(default)]
    worker_api_token: Option<String>,
    #[serde(default)]
    worker_log_level: Option<String>,
    #[serde(default)]
    worker_log_format: Option<String>,
}

impl JobsmithConfig {
    /// Load from the process environment and validate.
    ///
    /// Any failure is a [`WorkerError::Config`]; the caller should not start
    /// leasing jobs.
    pub fn load() -> WorkerResult<Self> {
        let config = Self::from_env()?;
        config
            .validate()
            .map_err(|errors| WorkerError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Build a configuration from the process environment, falling back to
    /// defaults for unset keys.
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_env_source(None)
    }

    /// Build a configuration from an explicit set of variables instead of
    /// the process environment.
    pub fn from_vars<I, K, V>(vars: I) -> WorkerResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_env_source(Some(map))
    }

    fn from_env_source(source: Option<Map<String, String>>) -> WorkerResult<Self> {
        let overrides: EnvOverrides = Config::builder()
            .add_source(Environment::default().source(source))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WorkerError::config(format!("failed to read environment: {e}")))?;

        let mut config = Self::default();

        if let Some(url) = overrides.redis_url {
            config.broker.url = url;
        }
        if let Some(backend) = overrides.worker_queue_backend {
            config.broker.backend = backend.parse()?;
        }
        if let Some(prefix) = overrides.worker_key_prefix {
            config.broker.key_prefix = prefix;
        }
        if let Some(ms) = overrides.worker_lease_timeout_ms {
            config.broker.lease_timeout_ms = ms;
        }
        if let Some(keep) = overrides.worker_keep_completed {
            config.broker.keep_completed = keep;
        }
        if let Some(keep) = overrides.worker_keep_failed {
            config.broker.keep_failed = keep;
        }
        if let Some(host) = overrides.worker_host {
            config.server.host = host;
        }
        if let Some(port) = overrides.worker_port {
            config.server.port = port;
        }
        if let Some(name) = overrides.worker_queue_name {
            config.queue_name = name;
        }
        if let Some(concurrency) = overrides.worker_concurrency {
            config.workers.concurrency = concurrency;
        }
        if let Some(ms) = overrides.worker_poll_interval_ms {
            config.workers.poll_interval_ms = ms;
        }
        if let Some(attempts) = overrides.worker_job_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = overrides.worker_job_backoff_ms {
            config.retry.backoff_delay_ms = ms;
        }
        config.server.admin_token = overrides.worker_api_token.filter(|t| !t.is_empty());
        if let Some(level) = overrides.worker_log_level {
            config.logging.level = level.parse()?;
        }
        if let Some(format) = overrides.worker_log_format {
            config.logging.json_format = format.trim().eq_ignore_ascii_case("json");
        }

        Ok(config)
    }

    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            broker: BrokerConfig::in_memory(),
            workers: WorkerConfig {
                concurrency: 2,
                poll_interval_ms: 250,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                json_format: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            broker: BrokerConfig {
                lease_timeout_ms: 5_000,
                retry_attempts: 1,
                retry_delay_ms: 10,
                ..BrokerConfig::in_memory()
            },
            workers: WorkerConfig {
                concurrency: 1,
                poll_interval_ms: 10,
            },
            retry: RetryPolicy::fixed(3, 20),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                json_format: false,
            },
            ..Default::default()
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.queue_name.trim().is_empty() {
            errors.push("Queue name must not be empty".to_string());
        }

        // Validate worker config
        if self.workers.concurrency == 0 {
            errors.push("Concurrency must be greater than 0".to_string());
        }

        if self.workers.concurrency > 1000 {
            errors.push("Concurrency should not exceed 1000".to_string());
        }

        if self.workers.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        // Validate retry policy
        if self.retry.max_attempts == 0 {
            errors.push("Max attempts must be at least 1".to_string());
        }

        if self.retry.backoff_delay_ms == 0 {
            errors.push("Backoff delay must be greater than 0".to_string());
        }

        // Validate broker config
        if self.broker.lease_timeout_ms == 0 {
            errors.push("Lease timeout must be greater than 0".to_string());
        }

        if self.broker.backend == BackendKind::Redis && self.broker.url.trim().is_empty() {
            errors.push("Broker URL must not be empty".to_string());
        }

        if self.server.port == 0 {
            errors.push("Listen port must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JobsmithConfig::default();
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.workers.concurrency, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_delay_ms, 5000);
        assert_eq!(config.server.port, 4001);
        assert_eq!(config.broker.keep_completed, 1000);
        assert_eq!(config.broker.keep_failed, 5000);
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_and_testing_configs() {
        let dev = JobsmithConfig::development();
        assert_eq!(dev.broker.backend, BackendKind::Memory);
        assert!(dev.validate().is_ok());

        let testing = JobsmithConfig::testing();
        assert_eq!(testing.workers.concurrency, 1);
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides_defaults() {
        let config = JobsmithConfig::from_vars([
            ("REDIS_URL", "redis://broker:6380"),
            ("WORKER_PORT", "5001"),
            ("WORKER_QUEUE_NAME", "mail"),
            ("WORKER_CONCURRENCY", "12"),
            ("WORKER_JOB_ATTEMPTS", "7"),
            ("WORKER_JOB_BACKOFF_MS", "1500"),
            ("WORKER_API_TOKEN", "s3cret"),
            ("WORKER_LOG_LEVEL", "debug"),
            ("WORKER_LOG_FORMAT", "json"),
            ("WORKER_KEEP_COMPLETED", "10"),
            ("WORKER_KEEP_FAILED", "20"),
        ])
        .unwrap();

        assert_eq!(config.broker.url, "redis://broker:6380");
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.queue_name, "mail");
        assert_eq!(config.workers.concurrency, 12);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.backoff_delay_ms, 1500);
        assert_eq!(config.server.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.json_format);
        assert_eq!(config.broker.keep_completed, 10);
        assert_eq!(config.broker.keep_failed, 20);
    }

    #[test]
    fn test_from_vars_empty_uses_defaults() {
        let config = JobsmithConfig::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.broker.url, "redis://127.0.0.1:6379");
        assert_eq!(config.workers.concurrency, 5);
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        assert!(JobsmithConfig::from_vars([("WORKER_CONCURRENCY", "many")]).is_err());
        assert!(JobsmithConfig::from_vars([("WORKER_LOG_LEVEL", "loud")]).is_err());
        assert!(JobsmithConfig::from_vars([("WORKER_QUEUE_BACKEND", "kafka")]).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = JobsmithConfig::default();
        assert!(config.validate().is_ok());

        config.workers.concurrency = 0;
        config.retry.max_attempts = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("Concurrency")));
        assert!(errors.iter().any(|e| e.contains("attempts")));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("fatal".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::Debug.as_directive(), "debug");
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
    }
}
