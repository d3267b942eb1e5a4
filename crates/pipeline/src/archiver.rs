//! Archival mover: moves free-tier results from hot storage to the cold
//! archive.
//!
//! Each step tolerates redelivery. The live tier is re-checked so a user who
//! upgraded after submission keeps hot results, and a record that already
//! carries an archive id is treated as a finished move.

use std::sync::Arc;

use tracing::info;

use gas_core::RetentionTier;
use gas_events::{ArchiveRequest, ReceivedMessage, decode};
use gas_infra::{BlobStore, ColdArchive, JobStore, JobStoreError, ProfileDirectory};

use crate::worker::{Disposition, HandlerError, MessageHandler};

pub struct Archiver {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    archive: Arc<dyn ColdArchive>,
    profiles: Arc<dyn ProfileDirectory>,
    results_bucket: String,
}

impl Archiver {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        archive: Arc<dyn ColdArchive>,
        profiles: Arc<dyn ProfileDirectory>,
        results_bucket: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            blobs,
            archive,
            profiles,
            results_bucket: results_bucket.into(),
        }
    }
}

impl MessageHandler for Archiver {
    fn name(&self) -> &str {
        "archiver"
    }

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
        let request: ArchiveRequest = decode(&message.body)?;
        let job_id = request.job_id;

        if self.profiles.retention_tier(&request.user_id)? == RetentionTier::Premium {
            info!(job_id = %job_id, user_id = %request.user_id, "user is premium; result stays in hot storage");
            return Ok(Disposition::Delete);
        }

        let record = self.jobs.get(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        if let Some(archive_id) = &record.archive_id {
            info!(job_id = %job_id, archive_id = %archive_id, "result already archived");
            return Ok(Disposition::Delete);
        }

        let result = request.result(&self.results_bucket);
        let payload = self.blobs.get(&result)?;
        let archive_id = self.archive.upload(&payload)?;
        self.jobs.mark_archived(job_id, archive_id.clone())?;
        self.blobs.delete(&result)?;

        info!(
            job_id = %job_id,
            archive_id = %archive_id,
            bytes = payload.len() as u64,
            "result archived"
        );
        Ok(Disposition::Delete)
    }
}
