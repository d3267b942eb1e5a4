//! Durable message queue abstraction (mechanics only).
//!
//! Queues provide **at-least-once delivery with a redelivery timer**:
//!
//! - A received message becomes invisible for the queue's visibility timeout.
//! - If it is not deleted before the timeout elapses it is delivered again,
//!   with a higher `receive_count` and a fresh receipt handle.
//! - A receipt handle is only valid until the timeout elapses or the message is
//!   deleted. Deleting with a stale handle fails with [`QueueError::InvalidReceipt`].
//! - Ordering is not guaranteed; consumers must not rely on it.
//!
//! Consumers must therefore be idempotent or guard their writes with
//! conditional updates.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Opaque token used to acknowledge (delete) one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub receipt: ReceiptHandle,
    /// How many times this message has been delivered, including this delivery.
    pub receive_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("receipt handle is invalid or expired: {0}")]
    InvalidReceipt(String),

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue state lock poisoned")]
    Poisoned,
}

impl QueueError {
    pub fn is_invalid_receipt(&self) -> bool {
        matches!(self, QueueError::InvalidReceipt(_))
    }
}

/// Durable, at-least-once message queue.
///
/// The trait is synchronous: every worker is a single-threaded polling loop
/// and only ever blocks on `receive` and on external calls.
pub trait MessageQueue: Send + Sync {
    /// Queue name (used in logs).
    fn name(&self) -> &str;

    /// Enqueue a message body. Returns the message id.
    fn send(&self, body: &str) -> Result<String, QueueError>;

    /// Long-poll for up to `max_messages` messages.
    ///
    /// Returns as soon as at least one message is available, or an empty vector
    /// once `wait` has elapsed.
    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge a delivery, removing the message from the queue.
    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&self, body: &str) -> Result<String, QueueError> {
        (**self).send(body)
    }

    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        (**self).receive(max_messages, wait)
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt)
    }
}

/// Dead-letter redrive: a message received more than `max_receive_count`
/// times is moved to `dead_letter` instead of being delivered again.
#[derive(Clone)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
    pub dead_letter: Arc<dyn MessageQueue>,
}

impl RedrivePolicy {
    pub fn new(max_receive_count: u32, dead_letter: Arc<dyn MessageQueue>) -> Self {
        Self {
            max_receive_count: max_receive_count.max(1),
            dead_letter,
        }
    }

    /// Whether a message that has already been received `receive_count` times
    /// must be dead-lettered rather than delivered once more.
    pub fn exhausted(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }
}

impl core::fmt::Debug for RedrivePolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedrivePolicy")
            .field("max_receive_count", &self.max_receive_count)
            .field("dead_letter", &self.dead_letter.name())
            .finish()
    }
}
