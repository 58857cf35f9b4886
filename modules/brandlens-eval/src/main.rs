use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use brandlens_eval::bootstrap::{cancel_after, init_tracing, Runtime};
use brandlens_eval::tasks::{fan_out_scheduled, ChannelTaskQueue};
use brandlens_eval::workflows::execute_task;
use brandlens_eval::{NetworkEvaluationWorkflow, OrgEvaluationWorkflow};

#[derive(Parser)]
#[command(name = "brandlens")]
#[command(about = "Brand visibility evaluation pipeline")]
#[command(version)]
struct Cli {
    /// TOML file with pipeline tunables
    #[arg(short, long, global = true, env = "BRANDLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Cancel the run after this many seconds (0 = never)
    #[arg(long, global = true, default_value_t = 3600)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run today's evaluation for one org
    RunOrg {
        #[arg(long)]
        org_id: Uuid,
    },
    /// Run today's evaluation for one network
    RunNetwork {
        #[arg(long)]
        network_id: Uuid,
    },
    /// Replace extractions for specific question runs of an org
    ReevalOrg {
        #[arg(long)]
        org_id: Uuid,
        /// Question run ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        question_run_ids: Vec<Uuid>,
    },
    /// Evaluate every active org and network
    Schedule {
        /// Tasks executed at the same time
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let runtime = Runtime::connect(cli.config.as_deref()).await?;
    let deps = Arc::new(runtime.pipeline_deps()?);
    let cancel = cancel_after(cli.timeout_secs);

    match cli.command {
        Commands::RunOrg { org_id } => {
            let report = OrgEvaluationWorkflow::new(deps).run(org_id, cancel).await?;
            info!(batch = %report.batch_id, charged = report.charged, cancelled = report.cancelled, "Org run finished");
            println!("{}", report.evaluation);
        }
        Commands::RunNetwork { network_id } => {
            let report = NetworkEvaluationWorkflow::new(deps)
                .run(network_id, cancel)
                .await?;
            info!(batch = %report.batch_id, charged = report.charged, cancelled = report.cancelled, "Network run finished");
            println!("{}", report.evaluation);
        }
        Commands::ReevalOrg {
            org_id,
            question_run_ids,
        } => {
            let totals = OrgEvaluationWorkflow::new(deps)
                .reevaluate(org_id, &question_run_ids, cancel)
                .await?;
            println!("{totals}");
        }
        Commands::Schedule { parallel } => {
            let failed = schedule(deps, runtime.store.clone(), parallel, cancel).await?;
            if failed > 0 {
                bail!("{failed} scheduled task(s) failed");
            }
        }
    }

    Ok(())
}

/// Fan out one task per active owner and execute them as they arrive.
async fn schedule(
    deps: Arc<brandlens_eval::PipelineDeps>,
    store: Arc<brandlens_store::PgStore>,
    parallel: usize,
    cancel: CancellationToken,
) -> Result<usize> {
    let (queue, mut rx) = ChannelTaskQueue::new(64);
    let producer = tokio::spawn(async move { fan_out_scheduled(store.as_ref(), &queue).await });

    let limit = Arc::new(tokio::sync::Semaphore::new(parallel.max(1)));
    let mut running = tokio::task::JoinSet::new();
    while let Some(task) = rx.recv().await {
        if cancel.is_cancelled() {
            warn!(kind = task.kind(), owner = %task.owner_id(), "Cancelled, task not started");
            continue;
        }
        let permit = limit.clone().acquire_owned().await?;
        let (deps, cancel) = (deps.clone(), cancel.clone());
        running.spawn(async move {
            let result = execute_task(deps, task, cancel).await;
            drop(permit);
            result
        });
    }

    let enqueued = producer.await??;
    let mut failed = 0;
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!(error = %e, "Scheduled task failed");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Scheduled task panicked");
            }
        }
    }

    info!(enqueued, failed, "Schedule complete");
    Ok(failed)
}
