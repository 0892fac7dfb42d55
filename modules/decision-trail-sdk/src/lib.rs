//! Client SDK for recording decision trails.
//!
//! Pipelines open an execution, then wrap each unit of work in a step scope.
//! Finished records are redacted and delivered to the collector; when the
//! collector is unreachable they are buffered in a local durable queue and
//! re-sent opportunistically on later calls.

mod client;
mod queue;
mod redact;

pub use client::{StepScope, TrailClient, TrailConfig};
pub use queue::{DurableQueue, QueuedRecord};
pub use redact::{REDACTED_MASK, redact};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
