//! Failure classification, exponential backoff, and delayed re-enqueue.

pub mod engine;
pub mod policy;
pub mod queue;

pub use engine::{NotRetryableReason, RetryDecision, RetryEngine, RetryError, RetryOutcome, RetryStats};
pub use policy::{JitterStrategy, RetryPolicy};
pub use queue::{DeadLetterEntry, InMemoryTaskQueue, QueueError, Task, TaskQueue, TaskStatus};
