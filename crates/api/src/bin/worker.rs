//! Background job worker: polls the generic job queue until interrupted.

use std::sync::Arc;

use anyhow::Context;
use signpost_infra::Settings;
use signpost_infra::jobs::{
    FulfillOrderHandler, JobType, JobWorker, ListingKitHandler, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    signpost_observability::init();

    let settings = Settings::from_env().context("loading configuration")?;
    let services = signpost_api::app::services::build_services(&settings).await?;

    let mut worker = JobWorker::new(services.jobs.clone());
    worker.register_handler(
        JobType::FulfillOrder,
        Arc::new(FulfillOrderHandler::new(services.fulfillment.clone())),
    );
    worker.register_handler(
        JobType::GenerateListingKit,
        Arc::new(ListingKitHandler::new(
            services.orders.clone(),
            services.kits.clone(),
            settings.render_timeout,
        )),
    );

    let config = WorkerConfig::default()
        .with_name(settings.worker.worker_id.clone())
        .with_batch_size(settings.worker.batch_size)
        .with_poll_interval(settings.worker.poll_interval);
    let handle = worker.spawn(config);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        failed = stats.jobs_failed,
        dead = stats.jobs_dead,
        "worker stopped"
    );
    Ok(())
}
