//! Dispatcher: turns submission notifications into running annotation tasks.
//!
//! Only PENDING jobs are staged and launched. The claim to RUNNING follows the
//! launch, and the task claims the job itself if the dispatcher never gets
//! there, so no interruption can leave a job RUNNING without a task.

use std::sync::Arc;

use tracing::{error, info};

use gas_core::JobStatus;
use gas_events::{JobSubmitted, ReceivedMessage, decode};
use gas_infra::{BlobStore, JobStore, JobStoreError};

use crate::launcher::{TaskLauncher, TaskSpec};
use crate::worker::{Disposition, HandlerError, MessageHandler};
use crate::workspace::JobWorkspace;

pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    launcher: Arc<dyn TaskLauncher>,
    workspace: JobWorkspace,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        launcher: Arc<dyn TaskLauncher>,
        workspace: JobWorkspace,
    ) -> Self {
        Self {
            jobs,
            blobs,
            launcher,
            workspace,
        }
    }
}

impl MessageHandler for Dispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    fn handle(&mut self, message: &ReceivedMessage) -> Result<Disposition, HandlerError> {
        let submission: JobSubmitted = decode(&message.body)?;
        let job_id = submission.job_id;

        let record = self.jobs.get(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        if record.status != JobStatus::Pending {
            info!(job_id = %job_id, status = %record.status, "duplicate submission delivery; not launching");
            return Ok(Disposition::Delete);
        }

        let paths = self.workspace.paths(job_id);
        let bytes = self.blobs.download_to(&submission.input(), &paths.input)?;
        info!(job_id = %job_id, user_id = %submission.user_id, bytes, "input downloaded");

        let spec = TaskSpec::from_submission(&submission, paths.input);
        if let Err(err) = self.launcher.launch(&spec) {
            error!(job_id = %job_id, error = %err, "failed to launch annotation task");
            if let Err(store_err) = self.jobs.mark_failed(job_id, &format!("launch failed: {err}")) {
                error!(job_id = %job_id, error = %store_err, "could not mark job as failed");
            }
            return Ok(Disposition::Delete);
        }

        match self.jobs.mark_running(job_id) {
            Ok(_) => info!(job_id = %job_id, "annotation task started"),
            // The task got there first.
            Err(err) if err.is_condition_failure() => {
                info!(job_id = %job_id, "annotation task started and already claimed the job")
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Disposition::Delete)
    }
}
