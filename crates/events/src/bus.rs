//! Notification bus (publish/subscribe fan-out into queues).
//!
//! Topics are named channels; each topic has zero or more subscribed queues.
//! Publishing wraps the payload in a [`NotificationEnvelope`] and sends one
//! copy to every subscribed queue. Delivery from there on follows the queue's
//! at-least-once contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::NotificationEnvelope;
use crate::queue::{MessageQueue, QueueError};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("failed to serialize notification: {0}")]
    Serialization(String),

    #[error("delivery from topic '{topic}' to queue '{queue}' failed: {source}")]
    Delivery {
        topic: String,
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("bus state lock poisoned")]
    Poisoned,
}

/// Publish side of the notification bus.
pub trait NotificationBus: Send + Sync {
    /// Publish a JSON message to a topic. Returns the notification id.
    fn publish(
        &self,
        topic: &str,
        subject: Option<&str>,
        message: &JsonValue,
    ) -> Result<String, BusError>;
}

impl<B> NotificationBus for Arc<B>
where
    B: NotificationBus + ?Sized,
{
    fn publish(
        &self,
        topic: &str,
        subject: Option<&str>,
        message: &JsonValue,
    ) -> Result<String, BusError> {
        (**self).publish(topic, subject, message)
    }
}

/// Serialize a typed message and publish it.
pub fn publish_message<T: Serialize>(
    bus: &dyn NotificationBus,
    topic: &str,
    subject: Option<&str>,
    message: &T,
) -> Result<String, BusError> {
    let value = serde_json::to_value(message).map_err(|e| BusError::Serialization(e.to_string()))?;
    bus.publish(topic, subject, &value)
}

/// Topic registry that fans each publication out to its subscribed queues.
///
/// Works with any [`MessageQueue`] implementation, so the same bus wiring is
/// used with in-memory queues in tests and Redis streams in production.
#[derive(Default)]
pub struct FanoutBus {
    topics: RwLock<HashMap<String, Vec<Arc<dyn MessageQueue>>>>,
}

impl FanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a topic (idempotent).
    pub fn create_topic(&self, topic: impl Into<String>) -> Result<(), BusError> {
        let mut topics = self.topics.write().map_err(|_| BusError::Poisoned)?;
        topics.entry(topic.into()).or_default();
        Ok(())
    }

    /// Subscribe a queue to a topic, creating the topic if needed.
    pub fn subscribe(&self, topic: impl Into<String>, queue: Arc<dyn MessageQueue>) -> Result<(), BusError> {
        let mut topics = self.topics.write().map_err(|_| BusError::Poisoned)?;
        topics.entry(topic.into()).or_default().push(queue);
        Ok(())
    }
}

impl core::fmt::Debug for FanoutBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut dbg = f.debug_map();
        if let Ok(topics) = self.topics.read() {
            for (topic, queues) in topics.iter() {
                let names: Vec<&str> = queues.iter().map(|q| q.name()).collect();
                dbg.entry(topic, &names);
            }
        }
        dbg.finish()
    }
}

impl NotificationBus for FanoutBus {
    fn publish(
        &self,
        topic: &str,
        subject: Option<&str>,
        message: &JsonValue,
    ) -> Result<String, BusError> {
        let queues = {
            let topics = self.topics.read().map_err(|_| BusError::Poisoned)?;
            topics
                .get(topic)
                .cloned()
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?
        };

        let envelope = NotificationEnvelope::wrap(topic, subject, message)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let body = serde_json::to_string(&envelope).map_err(|e| BusError::Serialization(e.to_string()))?;

        // Attempt every subscriber; report the first failure.
        let mut first_error = None;
        for queue in &queues {
            if let Err(source) = queue.send(&body) {
                warn!(topic, queue = queue.name(), error = %source, "fan-out delivery failed");
                first_error.get_or_insert(BusError::Delivery {
                    topic: topic.to_string(),
                    queue: queue.name().to_string(),
                    source,
                });
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        debug!(topic, subscribers = queues.len(), message_id = %envelope.message_id, "notification published");
        Ok(envelope.message_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::envelope::unwrap_body;
    use crate::in_memory_queue::InMemoryQueue;

    #[test]
    fn publication_reaches_every_subscriber_wrapped() {
        let bus = FanoutBus::new();
        let a = Arc::new(InMemoryQueue::new("a"));
        let b = Arc::new(InMemoryQueue::new("b"));
        bus.subscribe("job-results", a.clone()).unwrap();
        bus.subscribe("job-results", b.clone()).unwrap();

        bus.publish("job-results", None, &json!({"job_id": "j"})).unwrap();

        for queue in [a, b] {
            let msg = queue.receive(1, Duration::ZERO).unwrap().remove(0);
            assert_eq!(unwrap_body(&msg.body).unwrap(), json!({"job_id": "j"}));
        }
    }

    #[test]
    fn topic_without_subscribers_accepts_publications() {
        let bus = FanoutBus::new();
        bus.create_topic("job-results").unwrap();
        assert!(bus.publish("job-results", None, &json!({})).is_ok());
    }

    #[test]
    fn unknown_topic_is_an_error() {
        let bus = FanoutBus::new();
        let err = bus.publish("nope", None, &json!({})).unwrap_err();
        assert!(matches!(err, BusError::UnknownTopic(t) if t == "nope"));
    }
}
