#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use gas_core::{FileRef, JobId, JobRecord, RetentionTier, UserId};
use gas_events::{InMemoryQueue, JobSubmitted, NotificationBus, publish_message};
use gas_infra::{BlobError, BlobStore, JobStore, PipelineConfig};
use gas_pipeline::runner::engine_outputs;
use gas_pipeline::{
    AnnotationEngine, Dispatcher, EngineError, EngineOutput, InMemoryBackends, PollLoop, Services,
    TaskRunner, ThreadLauncher,
};

pub const INPUTS_BUCKET: &str = "gas-inputs";

/// Annotation engine that writes fixed outputs beside the input.
#[derive(Debug, Default)]
pub struct FakeEngine {
    pub fail: bool,
    pub runs: AtomicUsize,
}

impl FakeEngine {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl AnnotationEngine for FakeEngine {
    fn annotate(&self, input: &Path) -> Result<EngineOutput, EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::Failed("exit status: 1".to_string()));
        }
        let out = engine_outputs(input)?;
        let data = fs::read(input).map_err(|_| EngineError::InvalidInput(input.to_path_buf()))?;
        fs::write(&out.result, [b"ANNOTATED\n".as_slice(), data.as_slice()].concat())
            .map_err(|_| EngineError::MissingOutput(out.result.clone()))?;
        fs::write(&out.log, b"variants: 1\n").map_err(|_| EngineError::MissingOutput(out.log.clone()))?;
        Ok(out)
    }
}

/// Blob store whose uploads of annotated results fail.
pub struct FailingUploads<B> {
    pub inner: B,
}

impl<B: BlobStore> BlobStore for FailingUploads<B> {
    fn get(&self, object: &FileRef) -> Result<Vec<u8>, BlobError> {
        self.inner.get(object)
    }

    fn put(&self, object: &FileRef, data: &[u8]) -> Result<(), BlobError> {
        if object.key.ends_with(".annot.vcf") {
            return Err(BlobError::Unavailable("injected upload failure".to_string()));
        }
        self.inner.put(object, data)
    }

    fn delete(&self, object: &FileRef) -> Result<(), BlobError> {
        self.inner.delete(object)
    }

    fn exists(&self, object: &FileRef) -> Result<bool, BlobError> {
        self.inner.exists(object)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub services: Services,
    pub backends: InMemoryBackends,
    /// The results queue wired by `Services::in_memory`.
    pub notifications: Arc<InMemoryQueue>,
    pub engine: Arc<FakeEngine>,
    pub launcher: Arc<ThreadLauncher>,
}

pub fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: dir.join("jobs"),
        blob_root: dir.join("blobs"),
        archive_root: dir.join("archive"),
        results_bucket: "gas-results".to_string(),
        key_prefix: "cnet".to_string(),
        poll_wait: Duration::ZERO,
        max_receive_count: 3,
        ..PipelineConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {}, FakeEngine::default())
    }

    pub fn with(tweak: impl FnOnce(&mut PipelineConfig), engine: FakeEngine) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        tweak(&mut config);

        let (services, backends) = Services::in_memory(&config).unwrap();
        let notifications = backends.results.clone();

        let engine = Arc::new(engine);
        let runner = Arc::new(services.task_runner(engine.clone()));
        let launcher = Arc::new(ThreadLauncher::new(runner));

        Self {
            dir,
            services,
            backends,
            notifications,
            engine,
            launcher,
        }
    }

    pub fn runner(&self) -> TaskRunner {
        self.services.task_runner(self.engine.clone())
    }

    pub fn dispatcher_loop(&self) -> PollLoop<Dispatcher> {
        let dispatcher = self.services.dispatcher(self.launcher.clone());
        self.services.poll_loop(self.services.queues.requests.clone(), dispatcher)
    }

    /// What the front end does: store the PENDING record and the input
    /// object, then publish the submission.
    pub fn submit(&self, user: &str, tier: RetentionTier) -> JobSubmitted {
        let job_id = JobId::new();
        let user_id = UserId::new(user).unwrap();
        let input_file_name = "sample.vcf".to_string();
        let input = FileRef::new(INPUTS_BUCKET, format!("cnet/{user}/{job_id}~{input_file_name}"));

        self.backends.blobs.put(&input, b"#CHROM\tPOS\n1\t100\n").unwrap();
        self.services
            .jobs
            .create(JobRecord::pending(
                job_id,
                user_id.clone(),
                format!("{user}@example.com"),
                input_file_name.clone(),
                input.clone(),
                tier,
                Utc::now(),
            ))
            .unwrap();
        self.backends.profiles.set_tier(user_id.clone(), tier);

        let submission = JobSubmitted {
            job_id,
            s3_inputs_bucket: input.bucket,
            s3_key_input_file: input.key,
            input_file_name,
            user_id,
            email: format!("{user}@example.com"),
            user_status: tier,
        };
        self.publish_submission(&submission);
        submission
    }

    pub fn publish_submission(&self, submission: &JobSubmitted) {
        let bus: &dyn NotificationBus = self.services.bus.as_ref();
        publish_message(bus, &self.services.config.topics.requests, Some("New job"), submission).unwrap();
    }

    pub fn record(&self, job_id: JobId) -> JobRecord {
        self.services.jobs.get(job_id).unwrap().unwrap()
    }
}
