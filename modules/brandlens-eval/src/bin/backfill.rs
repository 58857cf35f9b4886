//! Repair missing evaluations listed in a CSV of `org_id,question_run_id`.
//!
//! Defaults to a dry run: nothing is written and no model is called.
//! Pass `--dry-run=false` to execute.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;
use uuid::Uuid;

use brandlens_eval::backfill::{read_csv, run_backfill, BackfillOptions};
use brandlens_eval::bootstrap::{cancel_after, init_tracing, Runtime};
use brandlens_eval::{PersistMode, SchedulerConfig};

#[derive(Parser)]
#[command(name = "brandlens-backfill")]
#[command(about = "Create missing evaluations for question runs listed in a CSV")]
struct Args {
    /// CSV with org_id,question_run_id columns (extra columns are ignored)
    #[arg(long, default_value = "runs_missing_evals.csv")]
    csv: PathBuf,

    /// Log what would happen without writing or calling any model
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    dry_run: bool,

    /// Only process rows for this org
    #[arg(long)]
    org_id: Option<Uuid>,

    /// Process at most this many rows after filtering (0 = all)
    #[arg(long, default_value_t = 0)]
    max_runs: usize,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Concurrent evaluation jobs (defaults to the config file value)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Log progress every N processed rows (defaults to the config file value)
    #[arg(long)]
    progress_every: Option<usize>,

    /// Delete and recreate existing extractions instead of skipping them
    #[arg(long)]
    replace: bool,

    /// TOML file with pipeline tunables
    #[arg(short, long, env = "BRANDLENS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let rows = read_csv(&args.csv)?;
    info!(csv = %args.csv.display(), rows = rows.len(), "Loaded CSV");

    let runtime = Runtime::connect(args.config.as_deref()).await?;
    let evaluator = runtime
        .evaluator(args.dry_run)
        .context("A live run needs OPENAI_API_KEY")?;
    let pipeline = &runtime.file.pipeline;

    let options = BackfillOptions {
        org_filter: args.org_id,
        max_runs: args.max_runs,
        dry_run: args.dry_run,
        mode: if args.replace {
            PersistMode::Replace
        } else {
            PersistMode::SkipExisting
        },
        scheduler: SchedulerConfig {
            concurrency: args.concurrency.unwrap_or(pipeline.concurrency),
            progress_every: args.progress_every.unwrap_or(pipeline.progress_every),
        },
        placeholder: pipeline.failed_placeholder.clone(),
    };

    let totals = run_backfill(
        runtime.store.clone(),
        runtime.store.clone(),
        evaluator,
        rows,
        &options,
        cancel_after(args.timeout_secs),
    )
    .await?;

    println!("{totals}");
    if args.dry_run {
        println!(
            "Dry run only. To execute: brandlens-backfill --dry-run=false --csv {}",
            args.csv.display()
        );
    }
    Ok(())
}
