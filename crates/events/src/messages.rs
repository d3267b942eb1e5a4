//! Typed wire messages exchanged between the front end and the workers.
//!
//! Field names are the wire names used by the front end and downstream
//! consumers; do not rename them.

use serde::{Deserialize, Serialize};

use gas_core::{ArchiveId, FileRef, JobId, RetentionTier, RetrievalId, UserId};

/// Human-readable text of the completion notification.
pub const JOB_COMPLETED_MESSAGE: &str = "Your job has completed successfully.";

/// A new job was submitted (consumed by the dispatcher).
///
/// The front end publishes the whole job item, so extra fields such as
/// `submit_time` and `job_status` are present and ignored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmitted {
    pub job_id: JobId,
    pub s3_inputs_bucket: String,
    pub s3_key_input_file: String,
    pub input_file_name: String,
    pub user_id: UserId,
    pub email: String,
    pub user_status: RetentionTier,
}

impl JobSubmitted {
    pub fn input(&self) -> FileRef {
        FileRef::new(&self.s3_inputs_bucket, &self.s3_key_input_file)
    }
}

/// A job finished successfully (consumed by the user-notification collaborator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub email: String,
    pub message: String,
}

impl JobCompleted {
    pub fn new(job_id: JobId, email: impl Into<String>) -> Self {
        Self {
            job_id,
            email: email.into(),
            message: JOB_COMPLETED_MESSAGE.to_string(),
        }
    }
}

/// A free-tier result is eligible for archival (consumed by the archiver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub user_id: UserId,
    pub job_id: JobId,
    pub s3_key_result_file: String,
    /// Absent in messages from older producers; the archiver then uses its
    /// configured results bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_results_bucket: Option<String>,
}

impl ArchiveRequest {
    pub fn for_result(user_id: UserId, job_id: JobId, result: &FileRef) -> Self {
        Self {
            user_id,
            job_id,
            s3_key_result_file: result.key.clone(),
            s3_results_bucket: Some(result.bucket.clone()),
        }
    }

    pub fn result(&self, default_bucket: &str) -> FileRef {
        let bucket = self.s3_results_bucket.as_deref().unwrap_or(default_bucket);
        FileRef::new(bucket, &self.s3_key_result_file)
    }
}

/// A user upgraded to premium; their archived results must come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub user_id: UserId,
}

/// An archive retrieval is in flight for one job (consumed by the thawer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThawRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub archive_id: ArchiveId,
    pub retrieval_id: RetrievalId,
    pub s3_results_bucket: String,
    pub s3_key_result_file: String,
}

impl ThawRequest {
    pub fn result(&self) -> FileRef {
        FileRef::new(&self.s3_results_bucket, &self.s3_key_result_file)
    }
}
