//! Annotation job workers: dispatcher, task runner, archival mover and
//! restoration, plus the polling loop and backend wiring they share.

pub mod archiver;
pub mod dispatcher;
pub mod launcher;
pub mod restorer;
pub mod runner;
pub mod services;
pub mod worker;
pub mod workspace;

pub use archiver::Archiver;
pub use dispatcher::Dispatcher;
pub use launcher::{LaunchError, ProcessLauncher, TaskLauncher, TaskSpec, ThreadLauncher};
pub use restorer::{RestoreRequester, Thawer};
pub use runner::{
    AnnotationEngine, CommandEngine, EngineError, EngineOutput, RunnerSettings, TaskError, TaskOutcome, TaskRunner,
};
pub use services::{InMemoryBackends, Queues, Services, ServicesError};
pub use worker::{Disposition, HandlerError, LoopStats, MessageHandler, PollLoop, PollOutcome, WorkerHandle};
pub use workspace::{JobPaths, JobWorkspace, ResultObjects};

/// Consumer name for this process within a queue's consumer group.
pub fn consumer_name(role: &str) -> String {
    format!("{role}-{}", std::process::id())
}
