use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use gas_infra::PipelineConfig;
use gas_pipeline::{ProcessLauncher, Services, consumer_name};

fn main() -> anyhow::Result<()> {
    gas_observability::init();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    let services = Services::connect(&config, &consumer_name("dispatcher")).context("connecting backends")?;
    let launcher = Arc::new(ProcessLauncher::new(&config.runner_program, services.workspace()));
    let dispatcher = services.dispatcher(launcher);

    info!(
        queue = %config.queues.requests,
        data_dir = %config.data_dir.display(),
        "dispatcher started"
    );
    services.poll_loop(services.queues.requests.clone(), dispatcher).run_forever();
    Ok(())
}
