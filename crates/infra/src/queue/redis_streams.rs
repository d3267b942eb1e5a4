//! Redis Streams-backed message queue (durable, at-least-once delivery).
//!
//! ## Mapping onto queue semantics
//!
//! - **Queue**: one stream (`<namespace>:queue:<name>`) read by one consumer group
//! - **Receive**: entries idle in the group's pending list for longer than the
//!   visibility timeout are claimed first (XPENDING + XCLAIM), then new entries
//!   are read with XREADGROUP, blocking up to the poll wait
//! - **Receipt**: `<entry id>/<delivery count>`; a delete only succeeds while
//!   the entry is still pending with that delivery count and has not been idle
//!   past the visibility timeout (checked atomically in Lua)
//! - **Dead-letter**: an entry whose delivery count reached the redrive limit
//!   is forwarded to the dead-letter queue instead of being claimed again

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use tracing::{debug, warn};

use gas_events::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage, RedrivePolicy};

const DEFAULT_NAMESPACE: &str = "gas";

const DEFAULT_GROUP: &str = "workers";

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

const BODY_FIELD: &str = "body";

/// Returns 1 on success, 0 if the entry is no longer pending, -1 if it was
/// redelivered since the receipt was issued, -2 if the receipt expired.
const DELETE_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #pending == 0 then
  return 0
end
local entry = pending[1]
if tonumber(entry[4]) ~= tonumber(ARGV[3]) then
  return -1
end
if tonumber(entry[3]) >= tonumber(ARGV[4]) then
  return -2
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

#[derive(Debug)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    name: String,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    redrive: Option<RedrivePolicy>,
    group_ready: AtomicBool,
}

fn connection_error(err: redis::RedisError) -> QueueError {
    QueueError::Connection(err.to_string())
}

fn command_error(command: &str) -> impl Fn(redis::RedisError) -> QueueError + '_ {
    move |err| QueueError::Command(format!("{command} failed: {err}"))
}

fn receipt_for(entry_id: &str, delivery_count: u32) -> ReceiptHandle {
    ReceiptHandle::new(format!("{entry_id}/{delivery_count}"))
}

fn parse_receipt(receipt: &ReceiptHandle) -> Result<(&str, u32), QueueError> {
    let invalid = || QueueError::InvalidReceipt(receipt.to_string());
    let (id, count) = receipt.as_str().rsplit_once('/').ok_or_else(invalid)?;
    let count = count.parse::<u32>().map_err(|_| invalid())?;
    Ok((id, count))
}

impl RedisStreamsQueue {
    /// Create a queue handle.
    ///
    /// `consumer` names this process within the consumer group; every worker
    /// process should use a distinct name.
    pub fn new(client: Arc<redis::Client>, name: impl Into<String>, consumer: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            client,
            stream_key: format!("{DEFAULT_NAMESPACE}:queue:{name}"),
            name,
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            redrive: None,
            group_ready: AtomicBool::new(false),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.stream_key = format!("{namespace}:queue:{}", self.name);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis().max(1) as u64
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(connection_error)
    }

    /// Ensure the consumer group exists (idempotent).
    fn ensure_group(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        // XGROUP CREATE ... MKSTREAM fails with BUSYGROUP when the group exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
        match created {
            Ok(_) => {}
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(command_error("XGROUP CREATE")(err)),
        }

        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn to_message(&self, entry: &StreamId, delivery_count: u32) -> Option<ReceivedMessage> {
        let body: Option<String> = entry.get(BODY_FIELD);
        match body {
            Some(body) => Some(ReceivedMessage {
                message_id: entry.id.clone(),
                body,
                receipt: receipt_for(&entry.id, delivery_count),
                receive_count: delivery_count,
            }),
            None => {
                warn!(queue = %self.name, entry_id = %entry.id, "stream entry without body field");
                None
            }
        }
    }

    /// Acknowledge and drop an entry without a receipt check.
    fn discard(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(entry_id)
            .ignore()
            .query::<()>(conn)
            .map_err(command_error("XACK/XDEL"))
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        policy: &RedrivePolicy,
        entry_id: &str,
        delivery_count: u32,
    ) -> Result<(), QueueError> {
        let range: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(entry_id)
            .arg(entry_id)
            .query(conn)
            .map_err(command_error("XRANGE"))?;

        if let Some(body) = range.ids.first().and_then(|e| e.get::<String>(BODY_FIELD)) {
            policy.dead_letter.send(&body)?;
        }
        self.discard(conn, entry_id)?;

        warn!(
            queue = %self.name,
            dead_letter = policy.dead_letter.name(),
            message_id = %entry_id,
            receive_count = delivery_count,
            "message moved to dead-letter queue"
        );
        Ok(())
    }

    /// Claim entries whose visibility timeout elapsed.
    fn reclaim_expired(&self, conn: &mut redis::Connection, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let min_idle = self.visibility_ms();
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(conn)
            .map_err(command_error("XPENDING"))?;

        let mut delivered = Vec::new();
        for entry in pending.ids {
            let times_delivered = entry.times_delivered as u32;

            if let Some(policy) = &self.redrive {
                if policy.exhausted(times_delivered) {
                    self.dead_letter(conn, policy, &entry.id, times_delivered)?;
                    continue;
                }
            }

            // XCLAIM re-checks the idle time, so a concurrent claim by another
            // consumer makes this return nothing.
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(min_idle)
                .arg(&entry.id)
                .query(conn)
                .map_err(command_error("XCLAIM"))?;

            for claimed_entry in &claimed.ids {
                if let Some(msg) = self.to_message(claimed_entry, times_delivered + 1) {
                    delivered.push(msg);
                }
            }
        }

        Ok(delivered)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer).arg("COUNT").arg(max);
        // BLOCK 0 would block forever.
        let block_ms = wait.as_millis() as u64;
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: Option<StreamReadReply> = cmd.query(conn).map_err(command_error("XREADGROUP"))?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .filter_map(|entry| self.to_message(entry, 1))
            .collect())
    }
}

impl MessageQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: &str) -> Result<String, QueueError> {
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn)?;

        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .arg("sent_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query(&mut conn)
            .map_err(command_error("XADD"))
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max = max_messages.max(1);
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn)?;

        let reclaimed = self.reclaim_expired(&mut conn, max)?;
        if !reclaimed.is_empty() {
            debug!(queue = %self.name, count = reclaimed.len(), "redelivering expired messages");
            return Ok(reclaimed);
        }

        self.read_new(&mut conn, max, wait)
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let (entry_id, delivery_count) = parse_receipt(receipt)?;
        let mut conn = self.connection()?;

        let status: i64 = redis::Script::new(DELETE_SCRIPT)
            .key(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(delivery_count)
            .arg(self.visibility_ms())
            .invoke(&mut conn)
            .map_err(command_error("delete script"))?;

        match status {
            1 => Ok(()),
            _ => Err(QueueError::InvalidReceipt(receipt.to_string())),
        }
    }
}
