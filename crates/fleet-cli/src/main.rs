mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use fleet_cloud::Ec2CloudClient;
use fleet_ranker::HttpPricingClient;
use fleet_scheduler::{SchedulerClient, SlurmScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = fleet_config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let _log_guard = logging::init(config.log_level, &config.log_file_name);

    let cloud = Ec2CloudClient::new(config.region.clone()).await;
    let scheduler: Arc<dyn SchedulerClient> = Arc::new(SlurmScheduler::new(config.slurm_bin_path.clone()));
    let pricing = HttpPricingClient::new();

    let report = fleet_reconciler::sweep(
        &config,
        &cloud,
        scheduler,
        &pricing,
        &cli.hosts_path,
        &cli.hosts_lock_path,
        &cli.lock_dir,
        &cli.stack_prefix,
    )
    .await;

    tracing::info!(
        nodegroups_swept = report.nodegroups_swept,
        nodegroups_skipped_lock_timeout = report.nodegroups_skipped_lock_timeout,
        acquisitions = report.acquisitions,
        acquisitions_exhausted = report.acquisitions_exhausted,
        transplants_completed = report.transplants_completed,
        transplants_aborted = report.transplants_aborted,
        orphan_instances_terminated = report.orphan_instances_terminated,
        orphan_spots_cancelled = report.orphan_spots_cancelled,
        error_count = report.errors.len(),
        "sweep complete"
    );
    for error in &report.errors {
        tracing::warn!(%error, "nodegroup-level error this sweep");
    }

    Ok(())
}
