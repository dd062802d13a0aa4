//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `corejobs:work` (one entry per work message)
//! - **Consumer Group**: `corejobs.workers`, shared by every worker process
//! - **Consumers**: one per `RedisStreamsQueue` instance (the worker name)
//!
//! ## Delivery
//!
//! - New entries are read with `XREADGROUP … >`.
//! - Entries idle in the pending list for longer than the visibility timeout
//!   are taken over with `XAUTOCLAIM` before new entries are read.
//! - `release` and `extend` re-claim the entry with `XCLAIM … IDLE … JUSTID`,
//!   setting its idle time so it becomes eligible for `XAUTOCLAIM` once the
//!   requested delay (or lease extension) has passed. `JUSTID` leaves the
//!   delivery count alone, so the receipt stays valid.
//! - `ack`, `release` and `extend` run as scripts that first check the entry
//!   is still owned by this delivery (consumer + delivery count).
//! - `XREADGROUP … BLOCK` holds its connection for the whole wait, so blocking
//!   reads use pooled connections of their own, one per concurrent reader.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{Delivery, JobQueue, MessageId, QueueDepth, QueueError, QueueMessage};
use crate::config::QueueConfig;

// KEYS[1] stream; ARGV: group, entry id, consumer, delivery count.
const ACK_SCRIPT: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #p == 0 then return 0 end
if p[1][2] ~= ARGV[3] or tonumber(p[1][4]) ~= tonumber(ARGV[4]) then return 0 end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

// As ACK_SCRIPT, plus ARGV[5] idle time in ms.
const RECLAIM_SCRIPT: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #p == 0 then return 0 end
if p[1][2] ~= ARGV[3] or tonumber(p[1][4]) ~= tonumber(ARGV[4]) then return 0 end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'IDLE', ARGV[5], 'JUSTID')
return 1
"#;

/// Redis Streams queue.
#[derive(Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    conn: MultiplexedConnection,
    /// Idle connections for blocking reads.
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl core::fmt::Debug for RedisStreamsQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisStreamsQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: &QueueConfig, consumer: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str()).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        let queue = Self {
            client: Arc::new(client),
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
            stream_key: config.stream_key.clone(),
            group: config.group.clone(),
            consumer: consumer.into(),
            visibility_timeout: config.visibility_timeout,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// `XGROUP CREATE … MKSTREAM`; an existing group is fine.
    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Unavailable(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn receipt(&self, delivery_count: u32) -> String {
        format!("{}:{}", self.consumer, delivery_count)
    }

    /// Take over one entry whose visibility timeout has lapsed.
    async fn claim_expired(&self) -> Result<Option<(MessageId, Vec<Value>)>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XAUTOCLAIM failed: {e}")))?;

        // [next-start, [entry...], [deleted-id...]]
        let Value::Bulk(parts) = reply else {
            return Ok(None);
        };
        let Some(Value::Bulk(entries)) = parts.get(1) else {
            return Ok(None);
        };
        Ok(entries.iter().find_map(parse_entry))
    }

    /// Block up to `wait` for a new entry.
    async fn read_new(&self, wait: Duration) -> Result<Option<(MessageId, Vec<Value>)>, QueueError> {
        let mut conn = self.blocking_connection().await?;
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;
        // Connections that errored are dropped rather than pooled.
        self.blocking.lock().await.push(conn);

        // nil on timeout, else [[stream, [entry...]]]
        let Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        for stream in &streams {
            if let Value::Bulk(pair) = stream {
                if let Some(Value::Bulk(entries)) = pair.get(1) {
                    if let Some(found) = entries.iter().find_map(parse_entry) {
                        return Ok(Some(found));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    /// Run an ownership-checked script for `delivery`; `false` means the
    /// receipt is stale.
    async fn owned_script(
        &self,
        script: &str,
        delivery: &Delivery,
        idle: Option<Duration>,
    ) -> Result<bool, QueueError> {
        let (consumer, count) = receipt_parts(delivery)?;
        let script = redis::Script::new(script);
        let mut invocation = script.key(&self.stream_key);
        invocation
            .arg(&self.group)
            .arg(&delivery.message_id.0)
            .arg(consumer)
            .arg(count);
        if let Some(idle) = idle {
            invocation.arg(idle.as_millis() as u64);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("queue script failed: {e}")))?;
        Ok(applied == 1)
    }

    /// Current delivery count of a pending entry.
    async fn delivery_count(&self, id: &MessageId) -> Result<u32, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&id.0)
            .arg(&id.0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;

        // [[id, consumer, idle-ms, delivery-count]]
        let count = match reply {
            Value::Bulk(rows) => match rows.first() {
                Some(Value::Bulk(row)) => match row.get(3) {
                    Some(Value::Int(n)) => *n,
                    _ => 1,
                },
                _ => 1,
            },
            _ => 1,
        };
        Ok(u32::try_from(count).unwrap_or(u32::MAX).max(1))
    }

    async fn into_delivery(&self, id: MessageId, fields: Vec<Value>) -> Result<Option<Delivery>, QueueError> {
        let payload = fields
            .chunks(2)
            .find_map(|pair| match pair {
                [Value::Data(k), Value::Data(v)] if k.as_slice() == b"payload" => Some(v.clone()),
                _ => None,
            });

        let message = match payload.map(|p| serde_json::from_slice::<QueueMessage>(&p)) {
            Some(Ok(message)) => message,
            other => {
                // Unreadable entries would be redelivered forever; drop them.
                warn!(message_id = %id, error = ?other.and_then(Result::err), "dropping undecodable stream entry");
                let mut conn = self.conn.clone();
                let _: redis::RedisResult<Value> = redis::cmd("XACK")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg(&id.0)
                    .query_async(&mut conn)
                    .await;
                return Ok(None);
            }
        };

        let delivery_count = self.delivery_count(&id).await?;
        Ok(Some(Delivery {
            receipt: self.receipt(delivery_count),
            message_id: id,
            message,
            delivery_count,
        }))
    }
}

#[async_trait::async_trait]
impl JobQueue for RedisStreamsQueue {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, job_id = %message.job_id), err)]
    async fn enqueue(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.get())
            .arg("correlation_id")
            .arg(message.correlation_id.to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))?;

        Ok(MessageId(id))
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if let Some((id, fields)) = self.claim_expired().await? {
            debug!(message_id = %id, consumer = %self.consumer, "claimed expired entry");
            return self.into_delivery(id, fields).await;
        }
        match self.read_new(wait).await? {
            Some((id, fields)) => self.into_delivery(id, fields).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.owned_script(ACK_SCRIPT, delivery, None).await? {
            Ok(())
        } else {
            Err(QueueError::StaleReceipt(delivery.message_id.clone()))
        }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id, delay_ms = delay.as_millis() as u64), err)]
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let idle = self.visibility_timeout.saturating_sub(delay);
        if self.owned_script(RECLAIM_SCRIPT, delivery, Some(idle)).await? {
            Ok(())
        } else {
            Err(QueueError::StaleReceipt(delivery.message_id.clone()))
        }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id), err)]
    async fn extend(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError> {
        let idle = self.visibility_timeout.saturating_sub(extension);
        if self.owned_script(RECLAIM_SCRIPT, delivery, Some(idle)).await? {
            Ok(())
        } else {
            Err(QueueError::StaleReceipt(delivery.message_id.clone()))
        }
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XLEN failed: {e}")))?;

        // Summary form: [count, min-id, max-id, [[consumer, count]...]]
        let summary: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;
        let pending = match summary {
            Value::Bulk(parts) => match parts.first() {
                Some(Value::Int(n)) => (*n).max(0) as u64,
                _ => 0,
            },
            _ => 0,
        };

        Ok(QueueDepth {
            ready: len.saturating_sub(pending),
            in_flight: pending,
        })
    }
}

fn unavailable(err: redis::RedisError) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

/// `consumer:delivery-count`, as minted by `RedisStreamsQueue::receipt`.
fn receipt_parts(delivery: &Delivery) -> Result<(&str, &str), QueueError> {
    delivery
        .receipt
        .rsplit_once(':')
        .ok_or_else(|| QueueError::StaleReceipt(delivery.message_id.clone()))
}

/// Stream entry format: `[id, [field, value, ...]]` (nil for deleted entries).
fn parse_entry(entry: &Value) -> Option<(MessageId, Vec<Value>)> {
    let Value::Bulk(parts) = entry else {
        return None;
    };
    let id = match parts.first()? {
        Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        Value::Status(s) => s.clone(),
        _ => return None,
    };
    match parts.get(1)? {
        Value::Bulk(fields) => Some((MessageId(id), fields.clone())),
        _ => None,
    }
}
