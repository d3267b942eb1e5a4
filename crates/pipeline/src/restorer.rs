//! Restoration of archived results after a user upgrades.
//!
//! Two stages, each its own queue consumer:
//! - [`RestoreRequester`] starts an archive retrieval for every archived job
//!   of the user and queues a [`ThawRequest`] per job.
//! - [`Thawer`] waits for each retrieval, writes the payload back to its
//!   original result key and clears the archive id.

use std::sync::Arc;

use tracing::{debug, info};

use gas_core::ResultStorage;
use gas_events::{MessageQueue, ReceivedMessage, RestoreRequest, ThawRequest, decode};
use gas_infra::{BlobStore, ColdArchive, JobStore, JobStoreError, RetrievalStatus};

use crate::worker::{Disposition, HandlerError, MessageHandler};
use crate::workspace::ResultObjects;

pub struct RestoreRequester {
    jobs: Arc<dyn JobStore>,
    archive: Arc<dyn ColdArchive>,
    thaw_queue: Arc<dyn MessageQueue>,
    results_bucket: String,
    key_prefix: String,
}

impl RestoreRequester {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        archive: Arc<dyn ColdArchive>,
        thaw_queue: Arc<dyn MessageQueue>,
        results_bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            archive,
            thaw_queue,
            results_bucket: results_bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }
}

impl MessageHandler for RestoreRequester {
    fn name(&self) -> &str {
        "restore-requester"
    }

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
        let request: RestoreRequest = decode(&message.body)?;

        let mut requested = 0usize;
        for job in self.jobs.list_by_user(&request.user_id)? {
            let ResultStorage::Archived(archive_id) = job.storage() else {
                continue;
            };

            let retrieval_id = self.archive.initiate_retrieval(archive_id)?;
            let objects = ResultObjects::new(
                &self.results_bucket,
                &self.key_prefix,
                &job.user_id,
                job.job_id,
                &job.input_file_name,
            );
            let thaw = ThawRequest {
                job_id: job.job_id,
                user_id: job.user_id.clone(),
                archive_id: archive_id.clone(),
                retrieval_id,
                s3_results_bucket: objects.result.bucket,
                s3_key_result_file: objects.result.key,
            };
            let body = serde_json::to_string(&thaw).map_err(|e| HandlerError::Other(e.to_string()))?;
            self.thaw_queue.send(&body)?;

            debug!(job_id = %job.job_id, archive_id = %archive_id, "archive retrieval requested");
            requested += 1;
        }

        info!(user_id = %request.user_id, jobs = requested, "restoration requested");
        Ok(Disposition::Delete)
    }
}

pub struct Thawer {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    archive: Arc<dyn ColdArchive>,
}

impl Thawer {
    pub fn new(jobs: Arc<dyn JobStore>, blobs: Arc<dyn BlobStore>, archive: Arc<dyn ColdArchive>) -> Self {
        Self { jobs, blobs, archive }
    }
}

impl MessageHandler for Thawer {
    fn name(&self) -> &str {
        "thawer"
    }

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
        let thaw: ThawRequest = decode(&message.body)?;
        let job_id = thaw.job_id;

        let record = self.jobs.get(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        if record.archive_id.as_ref() != Some(&thaw.archive_id) {
            info!(job_id = %job_id, archive_id = %thaw.archive_id, "job no longer archived under this id; dropping");
            return Ok(Disposition::Delete);
        }

        let payload = match self.archive.retrieval_status(&thaw.retrieval_id)? {
            RetrievalStatus::InProgress => {
                debug!(job_id = %job_id, retrieval_id = %thaw.retrieval_id, "retrieval still in progress");
                return Ok(Disposition::Retain);
            }
            RetrievalStatus::Ready(payload) => payload,
        };

        let result = thaw.result();
        self.blobs.put(&result, &payload)?;

        match self.jobs.mark_restored(job_id, &thaw.archive_id, result.clone()) {
            Ok(_) => {}
            Err(err) if err.is_condition_failure() => {
                info!(job_id = %job_id, error = %err, "job already restored");
                return Ok(Disposition::Delete);
            }
            Err(err) => return Err(err.into()),
        }

        self.archive.delete(&thaw.archive_id)?;
        info!(job_id = %job_id, result = %result, bytes = payload.len() as u64, "result restored");
        Ok(Disposition::Delete)
    }
}
