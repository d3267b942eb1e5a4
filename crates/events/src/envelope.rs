//! Notification envelopes and queue-body decoding.
//!
//! A message published to a notification topic reaches each subscribed queue
//! wrapped in a [`NotificationEnvelope`]; the original payload is carried as a
//! JSON *string* in the `Message` field. Producers may also write straight to
//! a queue, so consumers accept both shapes and unwrap at most one level.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Wire shape of a topic delivery into a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    pub message_id: String,
    pub topic_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEnvelope {
    pub fn wrap(topic: &str, subject: Option<&str>, message: &JsonValue) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: "Notification".to_string(),
            message_id: Uuid::new_v4().to_string(),
            topic_arn: topic.to_string(),
            subject: subject.map(str::to_string),
            message: serde_json::to_string(message)?,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The body (or the wrapped `Message`) is not valid JSON.
    #[error("invalid JSON in message body: {0}")]
    InvalidJson(String),

    /// Valid JSON, but required fields are missing or have the wrong type.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Parse a queue body, unwrapping one notification level if present.
pub fn unwrap_body(body: &str) -> Result<JsonValue, EnvelopeError> {
    let outer: JsonValue =
        serde_json::from_str(body).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    match outer.get("Message") {
        Some(JsonValue::String(inner)) => {
            serde_json::from_str(inner).map_err(|e| EnvelopeError::InvalidJson(format!("Message field: {e}")))
        }
        Some(inner @ JsonValue::Object(_)) => Ok(inner.clone()),
        Some(other) => Err(EnvelopeError::Malformed(format!(
            "Message field must be a JSON string, found {other}"
        ))),
        None => Ok(outer),
    }
}

/// Decode a typed message from a queue body.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, EnvelopeError> {
    let value = unwrap_body(body)?;
    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}
