//! `gas-core`: domain foundation for the annotation job pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its state machine, retention tiers.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{ArchiveId, JobId, RetrievalId, UserId};
pub use job::{FileRef, JobRecord, JobStatus, ResultStorage, RetentionTier};
