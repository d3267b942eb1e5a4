//! Annotation task runner: run the engine on one job's input, publish the
//! outputs and finalize the job record.
//!
//! The runner holds the per-job lease for the whole run, so two runners never
//! process the same job concurrently. Under the lease it claims a PENDING job
//! itself and skips one that is already finished. Finalization is conditional
//! on the job still being RUNNING; a runner that loses that race publishes
//! nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use gas_core::{JobId, JobStatus};
use gas_events::{ArchiveRequest, BusError, JobCompleted, NotificationBus, publish_message};
use gas_infra::{BlobError, BlobStore, Completion, JobStore, JobStoreError};

use crate::launcher::TaskSpec;
use crate::workspace::ResultObjects;

const COMPLETED_SUBJECT: &str = "Job completed";
const ARCHIVE_SUBJECT: &str = "Archive result";

/// Files produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub result: PathBuf,
    pub log: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start annotation engine {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("annotation engine exited with {0}")]
    Failed(String),

    #[error("annotation engine did not produce {0}")]
    MissingOutput(PathBuf),

    #[error("invalid engine input {0}")]
    InvalidInput(PathBuf),
}

/// The annotation algorithm itself.
pub trait AnnotationEngine: Send + Sync {
    /// Annotate `input`, writing outputs next to it.
    fn annotate(&self, input: &Path) -> Result<EngineOutput, EngineError>;
}

/// Expected engine outputs for an input `<dir>/<stem>.vcf`.
pub fn engine_outputs(input: &Path) -> Result<EngineOutput, EngineError> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| EngineError::InvalidInput(input.to_path_buf()))?;
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    Ok(EngineOutput {
        result: dir.join(format!("{stem}.annot.vcf")),
        log: dir.join(format!("{stem}.vcf.count.log")),
    })
}

/// Runs an external program: `<program> [args..] <input>`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl AnnotationEngine for CommandEngine {
    fn annotate(&self, input: &Path) -> Result<EngineOutput, EngineError> {
        let expected = engine_outputs(input)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(input);
        if let Some(dir) = input.parent() {
            cmd.current_dir(dir);
        }
        let status = cmd.status().map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(EngineError::Failed(status.to_string()));
        }

        for path in [&expected.result, &expected.log] {
            if !path.is_file() {
                return Err(EngineError::MissingOutput(path.clone()));
            }
        }
        Ok(expected)
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Job completed and notifications were published.
    Completed { elapsed: Duration },
    /// Another runner holds the job's lease.
    Duplicate,
    /// The job was already finished when this runner started, or stopped
    /// being RUNNING before it could be finalized.
    AlreadyFinalized,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task configuration error: {0}")]
    Config(String),

    #[error("annotation failed: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to upload {object}: {source}")]
    Upload {
        object: String,
        #[source]
        source: BlobError,
    },

    #[error("job store error: {0}")]
    JobStore(#[source] JobStoreError),

    #[error("failed to publish notification: {0}")]
    Notification(#[from] BusError),

    #[error("failed to acquire job lease: {0}")]
    Lease(#[source] JobStoreError),
}

impl TaskError {
    /// Process exit code for the task runner binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            TaskError::Config(_) => 1,
            TaskError::Engine(_) => 2,
            TaskError::Upload { .. } => 3,
            TaskError::JobStore(_) => 4,
            TaskError::Notification(_) => 5,
            TaskError::Lease(_) => 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub results_bucket: String,
    pub key_prefix: String,
    pub results_topic: String,
    pub archive_topic: String,
    pub lease_ttl: Duration,
    pub record_engine_failures: bool,
}

pub struct TaskRunner {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn NotificationBus>,
    engine: Arc<dyn AnnotationEngine>,
    settings: RunnerSettings,
}

impl TaskRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn NotificationBus>,
        engine: Arc<dyn AnnotationEngine>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            jobs,
            blobs,
            bus,
            engine,
            settings,
        }
    }

    pub fn run(&self, spec: &TaskSpec) -> Result<TaskOutcome, TaskError> {
        let job_id = spec.job_id;
        let owner = format!("runner-{}-{}", std::process::id(), Uuid::new_v4());

        let acquired = self
            .jobs
            .acquire_lease(job_id, &owner, self.settings.lease_ttl)
            .map_err(TaskError::Lease)?;
        if !acquired {
            info!(job_id = %job_id, "job is being processed by another runner; skipping");
            return Ok(TaskOutcome::Duplicate);
        }

        let outcome = self.run_leased(spec);

        if let Err(err) = self.jobs.release_lease(job_id, &owner) {
            warn!(job_id = %job_id, error = %err, "failed to release job lease");
        }
        outcome
    }

    /// Move the job to RUNNING if the dispatcher has not. Returns `false` when
    /// the job is past RUNNING already.
    fn claim(&self, job_id: JobId) -> Result<bool, TaskError> {
        match self.jobs.mark_running(job_id) {
            Ok(_) => return Ok(true),
            Err(err) if err.is_condition_failure() => {}
            Err(err) => return Err(TaskError::JobStore(err)),
        }
        let record = self
            .jobs
            .get(job_id)
            .map_err(TaskError::JobStore)?
            .ok_or(TaskError::JobStore(JobStoreError::NotFound(job_id)))?;
        Ok(record.status == JobStatus::Running)
    }

    fn run_leased(&self, spec: &TaskSpec) -> Result<TaskOutcome, TaskError> {
        let job_id = spec.job_id;

        if !self.claim(job_id)? {
            info!(job_id = %job_id, "job already finalized; not running the engine");
            return Ok(TaskOutcome::AlreadyFinalized);
        }

        let started = Instant::now();
        let output = match self.engine.annotate(&spec.input_path) {
            Ok(output) => output,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "annotation engine failed");
                if self.settings.record_engine_failures {
                    if let Err(store_err) = self.jobs.mark_failed(job_id, &err.to_string()) {
                        warn!(job_id = %job_id, error = %store_err, "could not mark job as failed");
                    }
                }
                return Err(TaskError::Engine(err));
            }
        };
        let elapsed = started.elapsed();
        info!(job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "annotation finished");

        let objects = ResultObjects::new(
            &self.settings.results_bucket,
            &self.settings.key_prefix,
            &spec.user_id,
            job_id,
            &spec.input_file_name,
        );
        for (local, object) in [(&output.result, &objects.result), (&output.log, &objects.log)] {
            self.blobs.upload_from(local, object).map_err(|source| TaskError::Upload {
                object: object.to_string(),
                source,
            })?;
        }

        for local in [&output.result, &output.log] {
            if let Err(err) = fs::remove_file(local) {
                warn!(job_id = %job_id, path = %local.display(), error = %err, "failed to remove local output");
            }
        }

        let completion = Completion {
            result: objects.result.clone(),
            log: objects.log.clone(),
            complete_time: Utc::now(),
        };
        match self.jobs.mark_completed(job_id, completion) {
            Ok(_) => {}
            Err(err) if err.is_condition_failure() => {
                info!(job_id = %job_id, error = %err, "job already finalized; not publishing");
                return Ok(TaskOutcome::AlreadyFinalized);
            }
            Err(err) => return Err(TaskError::JobStore(err)),
        }

        publish_message(
            self.bus.as_ref(),
            &self.settings.results_topic,
            Some(COMPLETED_SUBJECT),
            &JobCompleted::new(job_id, spec.email.clone()),
        )?;

        if spec.user_tier.is_retention_limited() {
            publish_message(
                self.bus.as_ref(),
                &self.settings.archive_topic,
                Some(ARCHIVE_SUBJECT),
                &ArchiveRequest::for_result(spec.user_id.clone(), job_id, &objects.result),
            )?;
        }

        info!(job_id = %job_id, tier = %spec.user_tier, "job completed");
        Ok(TaskOutcome::Completed { elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_outputs_sit_beside_the_input() {
        let out = engine_outputs(Path::new("/data/j1/j1.vcf")).unwrap();
        assert_eq!(out.result, PathBuf::from("/data/j1/j1.annot.vcf"));
        assert_eq!(out.log, PathBuf::from("/data/j1/j1.vcf.count.log"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            TaskError::Config(String::new()).exit_code(),
            TaskError::Engine(EngineError::Failed(String::new())).exit_code(),
            TaskError::Upload {
                object: String::new(),
                source: BlobError::Unavailable(String::new()),
            }
            .exit_code(),
            TaskError::JobStore(JobStoreError::Storage(String::new())).exit_code(),
            TaskError::Notification(BusError::Poisoned).exit_code(),
            TaskError::Lease(JobStoreError::Storage(String::new())).exit_code(),
        ];
        assert_eq!(codes, [1, 2, 3, 4, 5, 6]);
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_reports_missing_outputs_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.vcf");
        fs::write(&input, "#VCF").unwrap();

        let ok_but_silent = CommandEngine::new("true", Vec::new());
        assert!(matches!(ok_but_silent.annotate(&input), Err(EngineError::MissingOutput(_))));

        let failing = CommandEngine::new("false", Vec::new());
        assert!(matches!(failing.annotate(&input), Err(EngineError::Failed(_))));

        let missing = CommandEngine::new("/nonexistent/annotate", Vec::new());
        assert!(matches!(missing.annotate(&input), Err(EngineError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_accepts_produced_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.vcf");
        fs::write(&input, "#VCF").unwrap();

        let script = "touch \"$(basename \"$0\" .vcf).annot.vcf\" \"$(basename \"$0\" .vcf).vcf.count.log\"";
        let engine = CommandEngine::new("sh", vec!["-c".to_string(), script.to_string()]);
        let out = engine.annotate(&input).unwrap();
        assert!(out.result.is_file());
        assert!(out.log.is_file());
    }
}
