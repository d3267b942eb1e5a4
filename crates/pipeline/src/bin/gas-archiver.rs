use anyhow::Context;
use tracing::info;

use gas_infra::PipelineConfig;
use gas_pipeline::{Services, consumer_name};

fn main() -> anyhow::Result<()> {
    gas_observability::init();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    let services = Services::connect(&config, &consumer_name("archiver")).context("connecting backends")?;

    info!(queue = %config.queues.archive, "archiver started");
    services
        .poll_loop(services.queues.archive.clone(), services.archiver())
        .run_forever();
    Ok(())
}
