//! `gas-events`: queue and notification mechanics plus the wire messages.
//!
//! Transport-agnostic: the traits here are implemented in memory (this crate)
//! and over Redis (`gas-infra`).

pub mod bus;
pub mod envelope;
pub mod in_memory_queue;
pub mod messages;
pub mod queue;

pub use bus::{publish_message, BusError, FanoutBus, NotificationBus};
pub use envelope::{decode, unwrap_body, EnvelopeError, NotificationEnvelope};
pub use in_memory_queue::InMemoryQueue;
pub use messages::{
    ArchiveRequest, JobCompleted, JobSubmitted, RestoreRequest, ThawRequest, JOB_COMPLETED_MESSAGE,
};
pub use queue::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage, RedrivePolicy};
