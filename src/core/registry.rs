//! Static handler registry.
//!
//! Job types form a closed set, [`JobKind`]. A [`HandlerRegistry`] maps every
//! kind to exactly one [`JobHandler`] and is complete and read-only once
//! built. Looking up a type string outside the set yields
//! [`WorkerError::UnsupportedJobType`], which is never retried.
//!
//! # Examples
//!
//! ```rust
//! use jobsmith::core::registry::{HandlerRegistry, JobKind, handler_fn};
//! use serde_json::json;
//!
//! let registry = HandlerRegistry::standard().with_handler(
//!     JobKind::EmailSend,
//!     handler_fn(|payload, ctx| async move {
//!         ctx.log("Sending through the test relay.").await?;
//!         Ok::<_, jobsmith::WorkerError>(json!({ "delivered": true, "payload": payload }))
//!     }),
//! );
//! assert!(registry.supports("email.send"));
//! assert!(!registry.supports("unknown.kind"));
//! ```

use crate::core::context::JobContext;
use crate::error::{WorkerError, WorkerResult};
use crate::handlers::{EmailHandler, InvoiceHandler, MatchHandler, ReminderHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// The closed set of job types this worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Notification email dispatch
    EmailSend,
    /// Appointment reminder dispatch
    ReminderSend,
    /// AI-driven matching workflow
    AiMatch,
    /// Invoicing provider call
    InvoiceIntegration,
}

impl JobKind {
    /// Every kind, in registration order.
    pub const ALL: [JobKind; 4] = [
        JobKind::EmailSend,
        JobKind::ReminderSend,
        JobKind::AiMatch,
        JobKind::InvoiceIntegration,
    ];

    /// The type string producers put on the job.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::EmailSend => "email.send",
            JobKind::ReminderSend => "reminder.send",
            JobKind::AiMatch => "ai.match",
            JobKind::InvoiceIntegration => "integration.invoice",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| WorkerError::UnsupportedJobType {
                job_type: s.to_string(),
            })
    }
}

/// Processes the payload of one job kind.
///
/// An `Err` (or a panic) counts as a failed attempt and is retried until the
/// job runs out of attempts.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt and return the job's result.
    async fn handle(&self, payload: Value, ctx: JobContext) -> WorkerResult<Value>;
}

/// A [`JobHandler`] backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: JobContext) -> WorkerResult<Value> {
        (self.0)(payload, ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkerResult<Value>> + Send + 'static,
{
    FnHandler(f)
}

/// Maps every [`JobKind`] to its handler.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Start an empty registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// The built-in handler for every kind.
    pub fn standard() -> Self {
        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobKind::EmailSend, Arc::new(EmailHandler::default()));
        handlers.insert(JobKind::ReminderSend, Arc::new(ReminderHandler::default()));
        handlers.insert(JobKind::AiMatch, Arc::new(MatchHandler::default()));
        handlers.insert(
            JobKind::InvoiceIntegration,
            Arc::new(InvoiceHandler::default()),
        );
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Replace the handler for one kind, keeping the rest.
    pub fn with_handler(self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.insert(kind, Arc::new(handler));
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Whether `job_type` has a handler.
    pub fn supports(&self, job_type: &str) -> bool {
        job_type
            .parse::<JobKind>()
            .is_ok_and(|kind| self.handlers.contains_key(&kind))
    }

    /// Registered type strings, in [`JobKind::ALL`] order.
    pub fn types(&self) -> Vec<&'static str> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .map(|kind| kind.as_str())
            .collect()
    }

    /// Look up the handler for `job_type`.
    pub fn handler_for(&self, job_type: &str) -> WorkerResult<Arc<dyn JobHandler>> {
        let kind: JobKind = job_type.parse()?;
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| WorkerError::UnsupportedJobType {
                job_type: job_type.to_string(),
            })
    }

    /// Run the handler for `job_type` against `payload`.
    pub async fn dispatch(
        &self,
        job_type: &str,
        payload: Value,
        ctx: JobContext,
    ) -> WorkerResult<Value> {
        let handler = self.handler_for(job_type)?;
        handler.handle(payload, ctx).await
    }
}

/// Builds a [`HandlerRegistry`] that must cover every [`JobKind`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    /// Set the handler for `kind`. A later registration replaces an earlier one.
    pub fn register(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Finish the registry, failing if any kind has no handler.
    pub fn build(self) -> WorkerResult<HandlerRegistry> {
        let missing: Vec<&str> = JobKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .map(|kind| kind.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(WorkerError::config(format!(
                "no handler registered for job types: {}",
                missing.join(", ")
            )));
        }

        tracing::debug!(count = self.handlers.len(), "Handler registry built");
        Ok(HandlerRegistry {
            handlers: Arc::new(self.handlers),
        })
    }
}
