//! Durable job worker: polls the disk job store, claims PENDING jobs, runs
//! the pipeline, persists results. Safe to run any number of instances
//! against the same tree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use loanjobs_core::reconcile::startup_with_orphans;
use loanjobs_core::runner::{PipelineRunner, ProcessRunner, SupervisedRunner};
use loanjobs_core::supervise::{systemd_run_available, JobSupervisor, SystemdSupervisor};
use loanjobs_core::worker::{warn_if_no_recent_heartbeat, WorkerLoop};
use loanjobs_core::{JobService, JobsConfig};

#[derive(Debug, Parser)]
#[command(name = "loanjobs-worker", about = "Loan document pipeline job worker (disk queue)")]
struct Args {
    /// Base path of the shared job tree (overrides NAS_ANALYZE).
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Seconds between polls.
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,

    /// Process at most one job, then exit.
    #[arg(long)]
    once: bool,

    /// Only process jobs for this tenant.
    #[arg(long)]
    tenant_id: Option<String>,

    /// Only process jobs for this loan.
    #[arg(long)]
    loan_id: Option<String>,

    /// Force direct child-process execution even when systemd is available.
    #[arg(long)]
    no_supervise: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("initializing tracing subscriber")?;

    let args = Args::parse();
    let mut cfg = JobsConfig::from_env().context("loading configuration")?;
    if let Some(base_path) = args.base_path {
        cfg.base_path = base_path;
    }
    cfg.poll_interval_secs = args.poll_interval;

    let supervisor: Arc<dyn JobSupervisor> =
        Arc::new(SystemdSupervisor::new(cfg.temp_dir.clone()));
    let supervise = !args.no_supervise && systemd_run_available();
    let runner: Arc<dyn PipelineRunner> = if supervise {
        Arc::new(SupervisedRunner::new(
            cfg.pipeline_command.clone(),
            SystemdSupervisor::new(cfg.temp_dir.clone()),
        ))
    } else {
        Arc::new(ProcessRunner::new(cfg.pipeline_command.clone()))
    };
    info!(
        base_path = %cfg.base_path.display(),
        supervised = supervise,
        "worker starting"
    );

    let service = Arc::new(JobService::new(cfg.clone(), runner));
    startup_with_orphans(&service, &supervisor);
    warn_if_no_recent_heartbeat(
        service.store().layout(),
        Duration::from_secs(cfg.heartbeat_stale_secs),
    );

    let worker = WorkerLoop::new(
        service,
        Duration::from_secs(cfg.poll_interval_secs),
        args.tenant_id,
        args.loan_id,
    );

    if args.once {
        let processed = worker.run_once().await;
        info!(processed, "single cycle complete");
        return Ok(());
    }

    tokio::select! {
        () = worker.run() => {},
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("shutdown signal received");
        },
    }
    Ok(())
}
