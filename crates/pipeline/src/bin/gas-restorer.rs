use anyhow::Context;
use tracing::info;

use gas_infra::PipelineConfig;
use gas_pipeline::{Services, consumer_name};

fn main() -> anyhow::Result<()> {
    gas_observability::init();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    let services = Services::connect(&config, &consumer_name("restorer")).context("connecting backends")?;

    let requester = services
        .poll_loop(services.queues.restore.clone(), services.restore_requester())
        .spawn()
        .context("starting restore requester")?;
    let thawer = services
        .poll_loop(services.queues.thaw.clone(), services.thawer())
        .spawn()
        .context("starting thawer")?;

    info!(restore_queue = %config.queues.restore, thaw_queue = %config.queues.thaw, "restorer started");

    let requested = requester.join();
    let thawed = thawer.join();
    info!(?requested, ?thawed, "restorer stopped");
    Ok(())
}
