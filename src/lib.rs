//! # Jobsmith
//!
//! A background job worker: producers enqueue typed jobs into a durable
//! queue, a fixed pool of slots leases and dispatches them to statically
//! registered handlers, and failed attempts are retried with a fixed backoff
//! until the attempt ceiling is reached.
//!
//! ## Features
//!
//! - **Static Dispatch**: job types map to handlers in a registry built at startup
//! - **Bounded Concurrency**: exactly `concurrency` jobs in flight per process
//! - **At-Least-Once Delivery**: leases expire and are reclaimed if a worker dies
//! - **Per-Job Log**: handlers append progress lines that survive retries
//! - **Graceful Shutdown**: stop leasing, drain in-flight jobs, then exit
//!
//! ## Quick Start
//!
//! ```rust
//! use jobsmith::prelude::*;
//! use serde_json::{Value, json};
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl JobHandler for Greeter {
//!     async fn handle(&self, payload: Value, ctx: JobContext) -> WorkerResult<Value> {
//!         ctx.log("Saying hello.").await?;
//!         Ok(json!({ "delivered": true, "payload": payload }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> WorkerResult<()> {
//!     let registry = HandlerRegistry::standard().with_handler(JobKind::EmailSend, Greeter);
//!     let jobsmith = Jobsmith::connect(JobsmithConfig::development(), registry).await?;
//!
//!     jobsmith.start().await?;
//!     jobsmith
//!         .enqueue("email.send", json!({ "to": "x@example.com" }), JobOptions::default())
//!         .await?;
//!     jobsmith.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod job;
pub mod logging;
pub mod queue;
pub mod server;

pub mod prelude {
    pub use crate::config::{BackendKind, JobsmithConfig, RetryPolicy};
    pub use crate::core::{
        HandlerRegistry, JobContext, JobHandler, JobKind, Jobsmith, handler_fn,
    };
    pub use crate::error::{WorkerError, WorkerResult};
    pub use crate::job::{JobCounts, JobId, JobOptions, JobRecord, JobStatus};
    pub use crate::queue::{QueueBackend, QueueClient};
    pub use async_trait::async_trait;
}

pub use crate::config::JobsmithConfig;
pub use crate::core::{HandlerRegistry, JobContext, JobHandler, JobKind, Jobsmith};
pub use crate::error::{WorkerError, WorkerResult};
pub use crate::job::{JobOptions, JobRecord, JobStatus};
