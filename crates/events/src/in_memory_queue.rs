//! In-memory message queue for tests/dev.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage, RedrivePolicy};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-memory queue with visibility timeouts and optional redrive.
///
/// - No IO / no async
/// - Same delivery contract as the durable queues (at-least-once, receipts
///   expire with the visibility timeout)
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: Option<RedrivePolicy>,
    entries: Mutex<Vec<Entry>>,
    available: Condvar,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            redrive: None,
            entries: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    /// Number of messages in the queue (visible or in flight).
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of every stored message, in enqueue order.
    pub fn bodies(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every in-flight message visible again, as if its visibility
    /// timeout had elapsed. Outstanding receipts become invalid.
    pub fn expire_in_flight(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let now = Instant::now();
            for entry in entries.iter_mut() {
                entry.visible_at = now;
                entry.receipt = None;
            }
        }
        self.available.notify_all();
    }

    fn take_visible(&self, entries: &mut Vec<Entry>, max: usize, now: Instant) -> Vec<ReceivedMessage> {
        let mut delivered = Vec::new();
        let mut idx = 0;

        while idx < entries.len() && delivered.len() < max {
            if entries[idx].visible_at > now {
                idx += 1;
                continue;
            }

            if let Some(policy) = &self.redrive {
                if policy.exhausted(entries[idx].receive_count) {
                    let entry = entries.remove(idx);
                    match policy.dead_letter.send(&entry.body) {
                        Ok(_) => warn!(
                            queue = %self.name,
                            dead_letter = policy.dead_letter.name(),
                            message_id = %entry.message_id,
                            receive_count = entry.receive_count,
                            "message moved to dead-letter queue"
                        ),
                        Err(e) => {
                            warn!(queue = %self.name, error = %e, "dead-letter send failed; keeping message");
                            entries.insert(idx, entry);
                            idx += 1;
                        }
                    }
                    continue;
                }
            }

            let entry = &mut entries[idx];
            let receipt = Uuid::new_v4().to_string();
            entry.receive_count += 1;
            entry.visible_at = now + self.visibility_timeout;
            entry.receipt = Some(receipt.clone());

            delivered.push(ReceivedMessage {
                message_id: entry.message_id.clone(),
                body: entry.body.clone(),
                receipt: ReceiptHandle::new(receipt),
                receive_count: entry.receive_count,
            });
            idx += 1;
        }

        delivered
    }
}

impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: &str) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        entries.push(Entry {
            message_id: message_id.clone(),
            body: body.to_string(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        drop(entries);

        self.available.notify_all();
        Ok(message_id)
    }

    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;

        loop {
            let now = Instant::now();
            let delivered = self.take_visible(&mut entries, max_messages.max(1), now);
            if !delivered.is_empty() || now >= deadline {
                return Ok(delivered);
            }

            // Sleep until the deadline, a send, or the next in-flight message
            // becoming visible again.
            let next_visible = entries
                .iter()
                .map(|e| e.visible_at)
                .filter(|at| *at > now)
                .min()
                .unwrap_or(deadline);
            let timeout = next_visible.min(deadline).saturating_duration_since(now);

            let (guard, _) = self
                .available
                .wait_timeout(entries, timeout)
                .map_err(|_| QueueError::Poisoned)?;
            entries = guard;
        }
    }

    fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        let now = Instant::now();

        let position = entries.iter().position(|e| {
            e.receipt.as_deref() == Some(receipt.as_str()) && e.visible_at > now
        });

        match position {
            Some(idx) => {
                entries.remove(idx);
                Ok(())
            }
            None => Err(QueueError::InvalidReceipt(receipt.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn receive_hides_message_until_deleted() {
        let queue = InMemoryQueue::new("requests");
        queue.send("hello").unwrap();

        let first = queue.receive(1, Duration::ZERO).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "hello");
        assert_eq!(first[0].receive_count, 1);

        // In flight: not visible to a second consumer.
        assert!(queue.receive(1, Duration::ZERO).unwrap().is_empty());

        queue.delete(&first[0].receipt).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_receipt_cannot_delete_redelivered_message() {
        let queue = InMemoryQueue::new("requests");
        queue.send("hello").unwrap();

        let first = queue.receive(1, Duration::ZERO).unwrap().remove(0);
        queue.expire_in_flight();

        let second = queue.receive(1, Duration::ZERO).unwrap().remove(0);
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.receipt, second.receipt);

        let err = queue.delete(&first.receipt).unwrap_err();
        assert!(err.is_invalid_receipt());
        queue.delete(&second.receipt).unwrap();
    }

    #[test]
    fn visibility_timeout_triggers_redelivery() {
        let queue = InMemoryQueue::new("requests").with_visibility_timeout(Duration::from_millis(20));
        queue.send("hello").unwrap();

        let first = queue.receive(1, Duration::ZERO).unwrap();
        assert_eq!(first.len(), 1);

        let again = queue.receive(1, Duration::from_millis(500)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert!(queue.delete(&first[0].receipt).is_err());
    }

    #[test]
    fn long_poll_returns_empty_after_wait() {
        let queue = InMemoryQueue::new("requests");
        let started = Instant::now();
        let got = queue.receive(1, Duration::from_millis(30)).unwrap();
        assert!(got.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new("requests"));
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.send("late").unwrap();
        });

        let got = queue.receive(1, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "late");
    }

    #[test]
    fn redrive_moves_poison_message_to_dead_letter_queue() {
        let dlq = Arc::new(InMemoryQueue::new("requests-dlq"));
        let queue = InMemoryQueue::new("requests").with_redrive(RedrivePolicy::new(2, dlq.clone()));
        queue.send("poison").unwrap();

        for expected in 1..=2 {
            let got = queue.receive(1, Duration::ZERO).unwrap();
            assert_eq!(got[0].receive_count, expected);
            queue.expire_in_flight();
        }

        assert!(queue.receive(1, Duration::ZERO).unwrap().is_empty());
        assert!(queue.is_empty());
        assert_eq!(dlq.bodies(), vec!["poison".to_string()]);
    }
}
