//! Work queue between the ingestion gateway and the worker pool.
//!
//! Delivery is at-least-once: a dequeued message stays invisible to other
//! consumers until it is acknowledged, released, or its visibility timeout
//! lapses, after which it is delivered again. Consumers running long jobs
//! extend the lease while they work. Ordering is not guaranteed.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corejobs_core::{CorrelationId, JobId, JobType};

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

/// Work message: just enough to find the job record again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub job_id: JobId,
    pub job_type: JobType,
    pub reference_id: String,
    pub correlation_id: CorrelationId,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a message to a consumer.
///
/// The receipt identifies this particular delivery; once the message has
/// been redelivered, the old receipt is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub receipt: String,
    pub message: QueueMessage,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// Ready / in-flight message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("stale receipt for message {0}")]
    StaleReceipt(MessageId),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueue a message.
    async fn enqueue(&self, message: QueueMessage) -> Result<MessageId, QueueError>;

    /// Wait up to `wait` for a visible message.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove the message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Give the message back; it becomes visible again after `delay`.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Keep the message invisible for `extension` from now. Fails with
    /// `StaleReceipt` once the message has been handed to another consumer.
    async fn extend(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError>;

    /// How long a delivery stays invisible unless extended.
    fn visibility_timeout(&self) -> Duration;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
