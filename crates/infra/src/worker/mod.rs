//! Worker pool: pulls deliveries off the queue and drives jobs through
//! `Processing` to a terminal state.
//!
//! Per delivery:
//! 1. `begin_attempt` claims the job (unknown or no-longer-runnable jobs are
//!    acknowledged and skipped).
//! 2. The registered handler runs with a [`JobContext`](crate::handlers::JobContext).
//! 3. Success or a permanent error records a terminal status, fenced to the
//!    attempt number, then acknowledges the message.
//! 4. A transient error releases the message with backoff until the retry
//!    ceiling is reached, after which the job is `Failed`.

pub mod pool;
pub mod processor;
pub mod retry;

pub use pool::{WorkerPool, WorkerPoolHandle};
pub use processor::{DeliveryOutcome, JobProcessor, WorkerStats};
pub use retry::{BackoffStrategy, RetryPolicy};
