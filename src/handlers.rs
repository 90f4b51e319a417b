//! Built-in job handlers.
//!
//! The providers behind these jobs (mail relay, reminder channel, matching
//! model, invoicing API) live outside this crate; each handler records its
//! progress, waits out the provider latency and acknowledges with the
//! payload it was given.

use crate::core::context::JobContext;
use crate::core::registry::JobHandler;
use crate::error::WorkerResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

async fn acknowledge(
    ctx: &JobContext,
    line: &str,
    latency: Duration,
    flag: &str,
    payload: Value,
) -> WorkerResult<Value> {
    ctx.log(line).await?;
    tokio::time::sleep(latency).await;

    let mut ack = serde_json::Map::new();
    ack.insert(flag.to_string(), Value::Bool(true));
    ack.insert("payload".to_string(), payload);
    Ok(Value::Object(ack))
}

macro_rules! simulated_handler {
    ($(#[$doc:meta])* $name:ident, $line:literal, $latency_ms:literal, $flag:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            latency: Duration,
        }

        impl $name {
            /// Use a different provider latency.
            pub fn with_latency(latency: Duration) -> Self {
                Self { latency }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::with_latency(Duration::from_millis($latency_ms))
            }
        }

        #[async_trait]
        impl JobHandler for $name {
            async fn handle(&self, payload: Value, ctx: JobContext) -> WorkerResult<Value> {
                acknowledge(&ctx, $line, self.latency, $flag, payload).await
            }
        }
    };
}

simulated_handler!(
    /// `email.send`: notification email dispatch.
    EmailHandler,
    "Dispatching email notification.",
    250,
    "delivered"
);

simulated_handler!(
    /// `reminder.send`: appointment reminder dispatch.
    ReminderHandler,
    "Sending appointment reminder.",
    200,
    "delivered"
);

simulated_handler!(
    /// `ai.match`: AI-driven matching workflow.
    MatchHandler,
    "Running AI matching workflow.",
    400,
    "matched"
);

simulated_handler!(
    /// `integration.invoice`: invoicing provider call.
    InvoiceHandler,
    "Calling invoicing provider.",
    300,
    "queued"
);
