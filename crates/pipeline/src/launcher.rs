//! Task launching: hand a staged job to an annotation task runner without
//! waiting for it.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use gas_core::{JobId, RetentionTier, UserId};
use gas_events::JobSubmitted;

use crate::runner::{TaskError, TaskOutcome, TaskRunner};
use crate::workspace::JobWorkspace;

/// Everything a task runner needs to process one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub job_id: JobId,
    pub user_id: UserId,
    pub email: String,
    pub input_file_name: String,
    /// Tier captured at submission.
    pub user_tier: RetentionTier,
    /// Downloaded input file.
    pub input_path: PathBuf,
}

impl TaskSpec {
    pub fn from_submission(msg: &JobSubmitted, input_path: PathBuf) -> Self {
        Self {
            job_id: msg.job_id,
            user_id: msg.user_id.clone(),
            email: msg.email.clone(),
            input_file_name: msg.input_file_name.clone(),
            user_tier: msg.user_status,
            input_path,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<(), LaunchError> {
        let body = serde_json::to_vec_pretty(self).map_err(|e| LaunchError::Serialization(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LaunchError::io(parent, e))?;
        }
        fs::write(path, body).map_err(|e| LaunchError::io(path, e))
    }

    pub fn read_from(path: &Path) -> Result<Self, LaunchError> {
        let raw = fs::read(path).map_err(|e| LaunchError::io(path, e))?;
        serde_json::from_slice(&raw).map_err(|e| LaunchError::Serialization(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task file error: {0}")]
    Serialization(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launcher state lock poisoned")]
    Poisoned,
}

impl LaunchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Starts a task asynchronously.
pub trait TaskLauncher: Send + Sync {
    fn launch(&self, spec: &TaskSpec) -> Result<(), LaunchError>;
}

impl<L> TaskLauncher for Arc<L>
where
    L: TaskLauncher + ?Sized,
{
    fn launch(&self, spec: &TaskSpec) -> Result<(), LaunchError> {
        (**self).launch(spec)
    }
}

/// Runs each task as a child process: `<program> <job dir>/task.json`, with
/// stdout and stderr appended to `<job dir>/<job_id>.vcf.log`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    workspace: JobWorkspace,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, workspace: JobWorkspace) -> Self {
        Self {
            program: program.into(),
            workspace,
        }
    }
}

impl TaskLauncher for ProcessLauncher {
    fn launch(&self, spec: &TaskSpec) -> Result<(), LaunchError> {
        let paths = self.workspace.paths(spec.job_id);
        spec.write_to(&paths.task_file)?;

        let log = File::options()
            .create(true)
            .append(true)
            .open(&paths.task_log)
            .map_err(|e| LaunchError::io(&paths.task_log, e))?;
        let log_err = log.try_clone().map_err(|e| LaunchError::io(&paths.task_log, e))?;

        let mut child = Command::new(&self.program)
            .arg(&paths.task_file)
            .current_dir(&paths.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let job_id = spec.job_id;
        info!(job_id = %job_id, pid = child.id(), "annotation task launched");

        // Reap the child so it does not linger as a zombie.
        let reaper = thread::Builder::new()
            .name(format!("reap-{job_id}"))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => info!(job_id = %job_id, "annotation task exited"),
                Ok(status) => warn!(job_id = %job_id, status = %status, "annotation task exited with failure"),
                Err(err) => error!(job_id = %job_id, error = %err, "failed to wait for annotation task"),
            });
        if let Err(err) = reaper {
            warn!(job_id = %job_id, error = %err, "could not start reaper thread");
        }
        Ok(())
    }
}

type TaskResult = Result<TaskOutcome, TaskError>;

/// Runs each task on a background thread of the current process.
pub struct ThreadLauncher {
    runner: Arc<TaskRunner>,
    running: Mutex<Vec<thread::JoinHandle<TaskResult>>>,
}

impl ThreadLauncher {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self {
            runner,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every launched task, in launch order.
    pub fn join_all(&self) -> Vec<TaskResult> {
        let handles = match self.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => return Vec::new(),
        };
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(TaskError::Config("task thread panicked".to_string())))
            })
            .collect()
    }
}

impl TaskLauncher for ThreadLauncher {
    fn launch(&self, spec: &TaskSpec) -> Result<(), LaunchError> {
        let runner = self.runner.clone();
        let task = spec.clone();
        let handle = thread::Builder::new()
            .name(format!("task-{}", spec.job_id))
            .spawn(move || runner.run(&task))
            .map_err(|source| LaunchError::Spawn {
                program: "task thread".to_string(),
                source,
            })?;

        self.running.lock().map_err(|_| LaunchError::Poisoned)?.push(handle);
        Ok(())
    }
}
