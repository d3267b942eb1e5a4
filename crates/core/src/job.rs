//! Job record and its lifecycle state machine.
//!
//! The job record is the single source of truth for a job. Transitions are
//! monotonic:
//!
//! ```text
//! PENDING ──▶ RUNNING ──▶ COMPLETED(hot result) ──▶ COMPLETED(archived)
//!    │           │                 ▲                        │
//!    └──▶ FAILED ◀┘                 └──────── restore ───────┘
//! ```
//!
//! Every mutating method validates the predecessor state first and leaves the
//! record untouched when it returns an error, so stores can apply them inside
//! a conditional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ArchiveId, JobId, UserId};

/// Retention tier of the submitting user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetentionTier {
    /// Time-limited access; results are moved to the cold archive.
    #[serde(rename = "free_user")]
    Free,
    /// Unlimited access; results are never archived.
    #[serde(rename = "premium_user")]
    Premium,
}

impl RetentionTier {
    pub fn is_retention_limited(self) -> bool {
        matches!(self, RetentionTier::Free)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetentionTier::Free => "free_user",
            RetentionTier::Premium => "premium_user",
        }
    }
}

impl core::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for RetentionTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free_user" => Ok(RetentionTier::Free),
            "premium_user" => Ok(RetentionTier::Premium),
            other => Err(DomainError::validation(format!("unknown retention tier '{other}'"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an object in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub bucket: String,
    pub key: String,
}

impl FileRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl core::fmt::Display for FileRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Where a completed job's result payload currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStorage<'a> {
    /// No result yet (job not completed, or failed).
    None,
    Hot(&'a FileRef),
    Archived(&'a ArchiveId),
}

/// One record per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub user_id: UserId,
    pub email: String,
    pub input_file_name: String,
    pub input: FileRef,
    pub status: JobStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub submit_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<FileRef>,
    #[serde(default)]
    pub log: Option<FileRef>,
    #[serde(default)]
    pub archive_id: Option<ArchiveId>,
    /// Tier captured at submission; never re-derived.
    pub user_tier: RetentionTier,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn pending(
        job_id: JobId,
        user_id: UserId,
        email: impl Into<String>,
        input_file_name: impl Into<String>,
        input: FileRef,
        user_tier: RetentionTier,
        submit_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            user_id,
            email: email.into(),
            input_file_name: input_file_name.into(),
            input,
            status: JobStatus::Pending,
            submit_time,
            complete_time: None,
            result: None,
            log: None,
            archive_id: None,
            user_tier,
            failure_reason: None,
        }
    }

    pub fn storage(&self) -> ResultStorage<'_> {
        match (&self.result, &self.archive_id) {
            (Some(result), None) => ResultStorage::Hot(result),
            (None, Some(archive_id)) => ResultStorage::Archived(archive_id),
            _ => ResultStorage::None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archive_id.is_some()
    }

    fn expect_status(&self, allowed: &[JobStatus], action: &str) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "cannot {action} job {} in status {}",
                self.job_id, self.status
            )))
        }
    }

    /// PENDING → RUNNING.
    pub fn start(&mut self) -> DomainResult<()> {
        self.expect_status(&[JobStatus::Pending], "start")?;
        self.status = JobStatus::Running;
        Ok(())
    }

    /// RUNNING → COMPLETED with the uploaded result and log.
    pub fn complete(&mut self, result: FileRef, log: FileRef, at: DateTime<Utc>) -> DomainResult<()> {
        self.expect_status(&[JobStatus::Running], "complete")?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.log = Some(log);
        self.complete_time = Some(at);
        self.archive_id = None;
        Ok(())
    }

    /// PENDING | RUNNING → FAILED.
    pub fn fail(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.expect_status(&[JobStatus::Pending, JobStatus::Running], "fail")?;
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Record that the result payload moved to the cold archive.
    ///
    /// Re-applying the same archive id is a no-op.
    pub fn archive(&mut self, archive_id: ArchiveId) -> DomainResult<()> {
        self.expect_status(&[JobStatus::Completed], "archive")?;
        self.archive_id = Some(archive_id);
        self.result = None;
        Ok(())
    }

    /// Bring an archived payload back to hot storage.
    pub fn restore(&mut self, expected_archive_id: &ArchiveId, result: FileRef) -> DomainResult<()> {
        self.expect_status(&[JobStatus::Completed], "restore")?;
        match &self.archive_id {
            Some(current) if current == expected_archive_id => {}
            Some(current) => {
                return Err(DomainError::conflict(format!(
                    "job {} is archived as {current}, not {expected_archive_id}",
                    self.job_id
                )));
            }
            None => {
                return Err(DomainError::conflict(format!(
                    "job {} is not archived",
                    self.job_id
                )));
            }
        }
        self.result = Some(result);
        self.archive_id = None;
        Ok(())
    }

    /// Check the cross-field invariants of the record.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.result.is_some() && self.archive_id.is_some() {
            return Err(DomainError::invariant(format!(
                "job {} has both a result reference and an archive id",
                self.job_id
            )));
        }
        let completed = self.status == JobStatus::Completed;
        if !completed && (self.result.is_some() || self.archive_id.is_some()) {
            return Err(DomainError::invariant(format!(
                "job {} holds a result payload while {}",
                self.job_id, self.status
            )));
        }
        if completed != self.complete_time.is_some() {
            return Err(DomainError::invariant(format!(
                "job {} completion time does not match status {}",
                self.job_id, self.status
            )));
        }
        if completed && self.result.is_none() && self.archive_id.is_none() {
            return Err(DomainError::invariant(format!(
                "completed job {} has neither a result nor an archive id",
                self.job_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending_job(tier: RetentionTier) -> JobRecord {
        JobRecord::pending(
            JobId::new(),
            UserId::new("user-1").unwrap(),
            "user@example.com",
            "a.vcf",
            FileRef::new("gas-inputs", "prefix/user-1/job~a.vcf"),
            tier,
            Utc::now(),
        )
    }

    fn result_ref() -> FileRef {
        FileRef::new("gas-results", "prefix/user-1/job/a.annot.vcf")
    }

    fn log_ref() -> FileRef {
        FileRef::new("gas-results", "prefix/user-1/job/a.vcf.count.log")
    }

    #[test]
    fn happy_path_through_archive_and_restore() {
        let mut job = pending_job(RetentionTier::Free);
        job.start().unwrap();
        job.complete(result_ref(), log_ref(), Utc::now()).unwrap();
        assert_eq!(job.storage(), ResultStorage::Hot(&result_ref()));

        let archive_id = ArchiveId::new("vault-1").unwrap();
        job.archive(archive_id.clone()).unwrap();
        assert_eq!(job.storage(), ResultStorage::Archived(&archive_id));
        job.check_invariants().unwrap();

        job.restore(&archive_id, result_ref()).unwrap();
        assert_eq!(job.storage(), ResultStorage::Hot(&result_ref()));
        job.check_invariants().unwrap();
    }

    #[test]
    fn start_requires_pending() {
        let mut job = pending_job(RetentionTier::Premium);
        job.start().unwrap();
        let before = job.clone();
        let err = job.start().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(job, before);
    }

    #[test]
    fn complete_requires_running() {
        let mut job = pending_job(RetentionTier::Free);
        assert!(job.complete(result_ref(), log_ref(), Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn archive_twice_with_same_id_is_idempotent() {
        let mut job = pending_job(RetentionTier::Free);
        job.start().unwrap();
        job.complete(result_ref(), log_ref(), Utc::now()).unwrap();
        let archive_id = ArchiveId::new("vault-1").unwrap();
        job.archive(archive_id.clone()).unwrap();
        let once = job.clone();
        job.archive(archive_id).unwrap();
        assert_eq!(job, once);
    }

    #[test]
    fn restore_rejects_unexpected_archive_id() {
        let mut job = pending_job(RetentionTier::Free);
        job.start().unwrap();
        job.complete(result_ref(), log_ref(), Utc::now()).unwrap();
        job.archive(ArchiveId::new("vault-1").unwrap()).unwrap();
        let err = job
            .restore(&ArchiveId::new("vault-2").unwrap(), result_ref())
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(job.is_archived());
    }

    #[test]
    fn failed_is_reachable_from_pending_and_running_only() {
        let mut job = pending_job(RetentionTier::Free);
        job.fail("engine crashed").unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let mut job = pending_job(RetentionTier::Free);
        job.start().unwrap();
        job.complete(result_ref(), log_ref(), Utc::now()).unwrap();
        assert!(job.fail("late").is_err());
    }

    #[test]
    fn wire_format_matches_front_end_values() {
        let job = pending_job(RetentionTier::Free);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["user_tier"], "free_user");
        assert!(json["submit_time"].is_i64());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Complete,
        Fail,
        Archive(u8),
        Restore(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Complete),
            Just(Op::Fail),
            (0u8..3).prop_map(Op::Archive),
            (0u8..3).prop_map(Op::Restore),
        ]
    }

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any sequence of operations, status never moves
        /// backwards and result/archive id are never both present.
        #[test]
        fn transitions_are_monotonic_and_storage_exclusive(
            ops in prop::collection::vec(op_strategy(), 0..24)
        ) {
            let mut job = pending_job(RetentionTier::Free);
            for op in ops {
                let before = job.clone();
                let outcome = match op {
                    Op::Start => job.start(),
                    Op::Complete => job.complete(result_ref(), log_ref(), Utc::now()),
                    Op::Fail => job.fail("boom"),
                    Op::Archive(n) => job.archive(ArchiveId::new(format!("vault-{n}")).unwrap()),
                    Op::Restore(n) => job.restore(&ArchiveId::new(format!("vault-{n}")).unwrap(), result_ref()),
                };

                if outcome.is_err() {
                    prop_assert_eq!(&job, &before);
                }
                prop_assert!(rank(job.status) >= rank(before.status));
                if job.status == JobStatus::Running {
                    prop_assert!(matches!(before.status, JobStatus::Pending | JobStatus::Running));
                }
                prop_assert!(job.check_invariants().is_ok());
            }
        }
    }
}
