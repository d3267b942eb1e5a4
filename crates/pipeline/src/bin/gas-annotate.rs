//! Runs one annotation task: `gas-annotate <task.json>`.
//!
//! Exit codes: 0 success (including duplicate or already-finalized runs),
//! 1 configuration, 2 engine, 3 upload, 4 job store, 5 notification, 6 lease.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use gas_infra::PipelineConfig;
use gas_pipeline::{CommandEngine, Services, TaskError, TaskOutcome, TaskSpec, consumer_name};

fn load() -> Result<(Services, TaskSpec), TaskError> {
    let task_file = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| TaskError::Config("usage: gas-annotate <task.json>".to_string()))?;

    let config = PipelineConfig::from_env().map_err(|e| TaskError::Config(e.to_string()))?;
    config.validate().map_err(|e| TaskError::Config(e.to_string()))?;
    let spec = TaskSpec::read_from(&task_file).map_err(|e| TaskError::Config(e.to_string()))?;
    let services =
        Services::connect(&config, &consumer_name("annotate")).map_err(|e| TaskError::Config(e.to_string()))?;
    Ok((services, spec))
}

fn main() -> ExitCode {
    gas_observability::init();

    let (services, spec) = match load() {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "annotation task could not start");
            return ExitCode::from(err.exit_code());
        }
    };

    let engine = Arc::new(CommandEngine::new(
        services.config.engine_program.clone(),
        services.config.engine_args.clone(),
    ));
    let runner = services.task_runner(engine);

    match runner.run(&spec) {
        Ok(TaskOutcome::Completed { elapsed }) => {
            info!(job_id = %spec.job_id, elapsed_ms = elapsed.as_millis() as u64, "annotation task finished");
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            info!(job_id = %spec.job_id, outcome = ?outcome, "annotation task skipped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(job_id = %spec.job_id, error = %err, exit_code = err.exit_code(), "annotation task failed");
            ExitCode::from(err.exit_code())
        }
    }
}
