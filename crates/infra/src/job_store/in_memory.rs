use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use gas_core::{JobId, JobRecord, UserId};

use super::{JobStore, JobStoreError, Mutation};

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    leases: RwLock<HashMap<JobId, Lease>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

impl JobStore for InMemoryJobStore {
    fn create(&self, record: JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&record.job_id) {
            return Err(JobStoreError::AlreadyExists(record.job_id));
        }
        jobs.insert(record.job_id, record);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut out: Vec<JobRecord> = jobs.values().filter(|j| &j.user_id == user_id).cloned().collect();
        out.sort_by_key(|j| (j.submit_time, j.job_id));
        Ok(out)
    }

    fn apply(&self, job_id: JobId, mutation: Mutation) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let current = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // Work on a copy so a failed mutation never leaves a partial write.
        let mut next = current.clone();
        mutation.apply(&mut next)?;
        jobs.insert(job_id, next.clone());
        Ok(next)
    }

    fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<bool, JobStoreError> {
        let mut leases = self.leases.write().map_err(|_| poisoned())?;
        let now = Instant::now();
        // Leases of crashed runners are never released.
        leases.retain(|_, lease| lease.expires_at > now);

        if let Some(lease) = leases.get(&job_id) {
            if lease.owner != owner && lease.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            job_id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release_lease(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        let mut leases = self.leases.write().map_err(|_| poisoned())?;
        if leases.get(&job_id).is_some_and(|l| l.owner == owner) {
            leases.remove(&job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use gas_core::{ArchiveId, FileRef, JobStatus, RetentionTier};
    use proptest::prelude::*;

    use super::*;
    use crate::job_store::Completion;

    fn record(user: &str) -> JobRecord {
        JobRecord::pending(
            JobId::new(),
            UserId::new(user).unwrap(),
            "u@example.com",
            "a.vcf",
            FileRef::new("gas-inputs", "p/u/j~a.vcf"),
            RetentionTier::Free,
            Utc::now(),
        )
    }

    fn completion() -> Completion {
        Completion {
            result: FileRef::new("gas-results", "p/u/j/a.annot.vcf"),
            log: FileRef::new("gas-results", "p/u/j/a.vcf.count.log"),
            complete_time: Utc::now(),
        }
    }

    #[test]
    fn create_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let job = record("u1");
        store.create(job.clone()).unwrap();
        assert!(matches!(store.create(job), Err(JobStoreError::AlreadyExists(_))));
    }

    #[test]
    fn only_one_of_two_claims_succeeds() {
        let store = InMemoryJobStore::new();
        let job = record("u1");
        let id = job.job_id;
        store.create(job).unwrap();

        assert_eq!(store.mark_running(id).unwrap().status, JobStatus::Running);
        let err = store.mark_running(id).unwrap_err();
        assert!(err.is_condition_failure());
        assert!(err.to_string().contains("expected status PENDING"));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn completion_requires_running() {
        let store = InMemoryJobStore::new();
        let job = record("u1");
        let id = job.job_id;
        store.create(job).unwrap();

        assert!(store.mark_completed(id, completion()).unwrap_err().is_condition_failure());

        store.mark_running(id).unwrap();
        let done = store.mark_completed(id, completion()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // A second finalize observes COMPLETED and changes nothing.
        assert!(store.mark_completed(id, completion()).unwrap_err().is_condition_failure());
        assert_eq!(store.get(id).unwrap().unwrap(), done);
    }

    #[test]
    fn archive_is_idempotent_and_restore_is_conditional() {
        let store = InMemoryJobStore::new();
        let job = record("u1");
        let id = job.job_id;
        store.create(job).unwrap();
        store.mark_running(id).unwrap();
        let done = store.mark_completed(id, completion()).unwrap();
        let result = done.result.clone().unwrap();

        let archive = ArchiveId::new("arc-1").unwrap();
        let first = store.mark_archived(id, archive.clone()).unwrap();
        let second = store.mark_archived(id, archive.clone()).unwrap();
        assert_eq!(first, second);
        assert!(first.result.is_none());

        let other = ArchiveId::new("arc-2").unwrap();
        assert!(store.mark_restored(id, &other, result.clone()).unwrap_err().is_condition_failure());

        let restored = store.mark_restored(id, &archive, result.clone()).unwrap();
        assert_eq!(restored.result, Some(result.clone()));
        assert!(restored.archive_id.is_none());
        assert!(store.mark_restored(id, &archive, result).unwrap_err().is_condition_failure());
    }

    #[test]
    fn missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.mark_running(JobId::new()), Err(JobStoreError::NotFound(_))));
    }

    #[test]
    fn list_by_user_is_ordered_by_submission() {
        let store = InMemoryJobStore::new();
        let mut older = record("u1");
        older.submit_time = Utc::now() - ChronoDuration::hours(1);
        let newer = record("u1");
        store.create(newer.clone()).unwrap();
        store.create(older.clone()).unwrap();
        store.create(record("u2")).unwrap();

        let jobs = store.list_by_user(&UserId::new("u1").unwrap()).unwrap();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![older.job_id, newer.job_id]);
    }

    #[test]
    fn lease_is_exclusive_until_released_or_expired() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();

        assert!(store.acquire_lease(id, "a", Duration::from_secs(60)).unwrap());
        assert!(!store.acquire_lease(id, "b", Duration::from_secs(60)).unwrap());
        assert!(store.acquire_lease(id, "a", Duration::from_secs(60)).unwrap());

        // Releasing someone else's lease does nothing.
        store.release_lease(id, "b").unwrap();
        assert!(!store.acquire_lease(id, "b", Duration::from_secs(60)).unwrap());

        store.release_lease(id, "a").unwrap();
        assert!(store.acquire_lease(id, "b", Duration::from_millis(1)).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.acquire_lease(id, "c", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn expired_leases_of_other_jobs_are_purged() {
        let store = InMemoryJobStore::new();
        let crashed = JobId::new();
        let live = JobId::new();

        assert!(store.acquire_lease(crashed, "gone", Duration::from_millis(1)).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.acquire_lease(live, "a", Duration::from_secs(60)).unwrap());

        let leases = store.leases.read().unwrap();
        assert!(!leases.contains_key(&crashed));
        assert!(leases.contains_key(&live));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Complete,
        Fail,
        Archive(u8),
        Restore(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Complete),
            Just(Op::Fail),
            (0u8..2).prop_map(Op::Archive),
            (0u8..2).prop_map(Op::Restore),
        ]
    }

    proptest! {
        #[test]
        fn every_stored_record_satisfies_invariants(ops in proptest::collection::vec(op(), 0..24)) {
            let store = InMemoryJobStore::new();
            let job = record("u1");
            let id = job.job_id;
            store.create(job).unwrap();

            for op in ops {
                let before = store.get(id).unwrap().unwrap();
                let outcome = match op {
                    Op::Start => store.mark_running(id),
                    Op::Complete => store.mark_completed(id, completion()),
                    Op::Fail => store.mark_failed(id, "boom"),
                    Op::Archive(n) => store.mark_archived(id, ArchiveId::new(format!("arc-{n}")).unwrap()),
                    Op::Restore(n) => store.mark_restored(
                        id,
                        &ArchiveId::new(format!("arc-{n}")).unwrap(),
                        FileRef::new("gas-results", "p/u/j/a.annot.vcf"),
                    ),
                };
                let after = store.get(id).unwrap().unwrap();

                match outcome {
                    Ok(updated) => prop_assert_eq!(&updated, &after),
                    Err(_) => prop_assert_eq!(&before, &after),
                }
                prop_assert!(after.check_invariants().is_ok());
                if before.status.is_terminal() {
                    prop_assert_eq!(before.status, after.status);
                }
            }
        }
    }
}
