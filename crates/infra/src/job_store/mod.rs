//! Job record storage.
//!
//! Every mutation is a conditional update: the store loads the record, applies
//! one [`Mutation`] through the domain state machine, and writes the result
//! back only if nothing else changed the record in between. A mutation whose
//! precondition does not hold fails with [`JobStoreError::ConditionFailed`] and
//! leaves the record untouched.

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use chrono::{DateTime, Utc};

use gas_core::{ArchiveId, DomainError, FileRef, JobId, JobRecord, UserId};

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;

/// Result locations written when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: FileRef,
    pub log: FileRef,
    pub complete_time: DateTime<Utc>,
}

/// One state change applied atomically to a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// PENDING → RUNNING.
    Start,
    /// RUNNING → COMPLETED.
    Complete(Completion),
    /// PENDING | RUNNING → FAILED.
    Fail(String),
    /// Replace the hot result with an archive id. Re-applying is a no-op.
    Archive(ArchiveId),
    /// Replace the archive id with a hot result, if the archive id matches.
    Restore { expected: ArchiveId, result: FileRef },
}

impl Mutation {
    /// Human-readable precondition, reported in `ConditionFailed`.
    pub fn precondition(&self) -> String {
        match self {
            Mutation::Start => "status PENDING".to_string(),
            Mutation::Complete(_) => "status RUNNING".to_string(),
            Mutation::Fail(_) => "status PENDING or RUNNING".to_string(),
            Mutation::Archive(_) => "status COMPLETED".to_string(),
            Mutation::Restore { expected, .. } => format!("archive id {expected}"),
        }
    }

    /// Apply the mutation to `record` in place.
    ///
    /// On error the record is unchanged.
    pub fn apply(self, record: &mut JobRecord) -> Result<(), JobStoreError> {
        let expected = self.precondition();
        let found = observed_state(record);
        let job_id = record.job_id;

        let outcome = match self {
            Mutation::Start => record.start(),
            Mutation::Complete(c) => record.complete(c.result, c.log, c.complete_time),
            Mutation::Fail(reason) => record.fail(reason),
            Mutation::Archive(archive_id) => record.archive(archive_id),
            Mutation::Restore { expected, result } => record.restore(&expected, result),
        };

        outcome.map_err(|err| match err {
            DomainError::Conflict(_) => JobStoreError::ConditionFailed {
                job_id,
                expected,
                found,
            },
            other => JobStoreError::Domain(other),
        })
    }
}

fn observed_state(record: &JobRecord) -> String {
    match &record.archive_id {
        Some(archive_id) => format!("status {} (archived as {archive_id})", record.status),
        None => format!("status {}", record.status),
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("conditional update of job {job_id} failed: expected {expected}, found {found}")]
    ConditionFailed {
        job_id: JobId,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobStoreError {
    /// Whether the error only means "someone else already did this".
    pub fn is_condition_failure(&self) -> bool {
        matches!(self, JobStoreError::ConditionFailed { .. })
    }
}

/// Job record store.
///
/// Implementations only need to provide atomic [`JobStore::apply`]; the
/// named transitions are expressed on top of it.
pub trait JobStore: Send + Sync {
    /// Insert a new record.
    fn create(&self, record: JobRecord) -> Result<(), JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// All records of one user, oldest submission first.
    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Atomically apply `mutation` and return the updated record.
    fn apply(&self, job_id: JobId, mutation: Mutation) -> Result<JobRecord, JobStoreError>;

    /// Try to take the exclusive per-job lease for `owner`.
    ///
    /// Returns `false` when another owner holds an unexpired lease. Acquiring
    /// a lease already held by the same owner refreshes it.
    fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<bool, JobStoreError>;

    /// Release the lease if `owner` still holds it.
    fn release_lease(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError>;

    fn mark_running(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.apply(job_id, Mutation::Start)
    }

    fn mark_completed(&self, job_id: JobId, completion: Completion) -> Result<JobRecord, JobStoreError> {
        self.apply(job_id, Mutation::Complete(completion))
    }

    fn mark_failed(&self, job_id: JobId, reason: &str) -> Result<JobRecord, JobStoreError> {
        self.apply(job_id, Mutation::Fail(reason.to_string()))
    }

    fn mark_archived(&self, job_id: JobId, archive_id: ArchiveId) -> Result<JobRecord, JobStoreError> {
        self.apply(job_id, Mutation::Archive(archive_id))
    }

    fn mark_restored(
        &self,
        job_id: JobId,
        expected_archive_id: &ArchiveId,
        result: FileRef,
    ) -> Result<JobRecord, JobStoreError> {
        self.apply(
            job_id,
            Mutation::Restore {
                expected: expected_archive_id.clone(),
                result,
            },
        )
    }
}

impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, record: JobRecord) -> Result<(), JobStoreError> {
        (**self).create(record)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(job_id)
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_user(user_id)
    }

    fn apply(&self, job_id: JobId, mutation: Mutation) -> Result<JobRecord, JobStoreError> {
        (**self).apply(job_id, mutation)
    }

    fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<bool, JobStoreError> {
        (**self).acquire_lease(job_id, owner, ttl)
    }

    fn release_lease(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        (**self).release_lease(job_id, owner)
    }
}
