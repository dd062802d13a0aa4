use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, JobQueue, MessageId, QueueDepth, QueueError, QueueMessage};

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    visible_at: Instant,
    receipt: Option<String>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u64, Entry>,
    next_seq: u64,
}

/// In-process queue with visibility-timeout redelivery.
///
/// Dequeue long-polls on a [`Notify`] that enqueue and release signal.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn arc(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(visibility_timeout))
    }

    fn seq_of(id: &MessageId) -> Option<u64> {
        id.0.strip_prefix("mem-")?.parse().ok()
    }

    /// Claim the first visible entry, or report when the next one becomes visible.
    async fn try_claim(&self) -> Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let visible = state
            .entries
            .iter()
            .find(|(_, e)| e.visible_at <= now)
            .map(|(&seq, _)| seq);
        let Some(seq) = visible else {
            return Err(state.entries.values().map(|e| e.visible_at).min());
        };
        let Some(entry) = state.entries.get_mut(&seq) else {
            return Err(None);
        };

        let receipt = Uuid::now_v7().to_string();
        entry.receipt = Some(receipt.clone());
        entry.delivery_count += 1;
        entry.visible_at = now + self.visibility_timeout;

        Ok(Delivery {
            message_id: MessageId(format!("mem-{seq}")),
            receipt,
            message: entry.message.clone(),
            delivery_count: entry.delivery_count,
        })
    }

    async fn with_current_entry<F>(&self, delivery: &Delivery, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut State, u64),
    {
        let stale = || QueueError::StaleReceipt(delivery.message_id.clone());
        let seq = Self::seq_of(&delivery.message_id).ok_or_else(stale)?;
        let mut state = self.state.lock().await;
        let current = state
            .entries
            .get(&seq)
            .and_then(|e| e.receipt.as_deref())
            .is_some_and(|r| r == delivery.receipt);
        if !current {
            return Err(stale());
        }
        f(&mut *state, seq);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            seq,
            Entry {
                message,
                visible_at: Instant::now(),
                receipt: None,
                delivery_count: 0,
            },
        );
        drop(state);
        self.notify.notify_one();
        Ok(MessageId(format!("mem-{seq}")))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let next_visible = match self.try_claim().await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_visible) => next_visible,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            // Woken early by enqueue/release, or by the timer.
            let _ = tokio::time::timeout_at(wake_at.max(now), self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.with_current_entry(delivery, |state, seq| {
            state.entries.remove(&seq);
        })
        .await
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.with_current_entry(delivery, |state, seq| {
            if let Some(entry) = state.entries.get_mut(&seq) {
                entry.receipt = None;
                entry.visible_at = Instant::now() + delay;
            }
        })
        .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError> {
        self.with_current_entry(delivery, |state, seq| {
            if let Some(entry) = state.entries.get_mut(&seq) {
                entry.visible_at = Instant::now() + extension;
            }
        })
        .await
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let in_flight = state
            .entries
            .values()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count() as u64;
        Ok(QueueDepth {
            ready: state.entries.len() as u64 - in_flight,
            in_flight,
        })
    }
}
