//! CSV-driven repair of missing evaluations.
//!
//! Input is `org_id,question_run_id[,...]` with an optional header. Any
//! malformed line fails the whole file before work starts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_common::{EvaluationJob, QuestionRun};
use brandlens_store::{EvalStore, OrgDirectory};

use crate::persister::PersistMode;
use crate::processor::EvaluationProcessor;
use crate::scheduler::{JobScheduler, SchedulerConfig};
use crate::stats::RunTotals;
use crate::traits::OrgEvaluator;

const RUN_LOOKUP_CHUNK: usize = 500;

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: blank line")]
    BlankLine { line: usize },

    #[error("line {line}: expected `org_id,question_run_id`, found {found} column(s)")]
    MissingColumn { line: usize, found: usize },

    #[error("line {line}: invalid {column} {value:?}")]
    InvalidUuid {
        line: usize,
        column: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvRow {
    pub org_id: Uuid,
    pub question_run_id: Uuid,
}

pub fn read_csv(path: &Path) -> Result<Vec<CsvRow>, CsvError> {
    let content = std::fs::read_to_string(path).map_err(|source| CsvError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_csv(&content)
}

pub fn parse_csv(content: &str) -> Result<Vec<CsvRow>, CsvError> {
    let mut rows = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let text = raw.trim_start_matches('\u{feff}').trim();
        if text.is_empty() {
            return Err(CsvError::BlankLine { line });
        }

        let cols: Vec<&str> = text.split(',').map(str::trim).collect();
        if idx == 0 && cols[0].eq_ignore_ascii_case("org_id") {
            continue;
        }
        if cols.len() < 2 {
            return Err(CsvError::MissingColumn {
                line,
                found: cols.len(),
            });
        }

        rows.push(CsvRow {
            org_id: parse_uuid(cols[0], "org_id", line)?,
            question_run_id: parse_uuid(cols[1], "question_run_id", line)?,
        });
    }

    Ok(rows)
}

fn parse_uuid(value: &str, column: &'static str, line: usize) -> Result<Uuid, CsvError> {
    Uuid::parse_str(value).map_err(|_| CsvError::InvalidUuid {
        line,
        column,
        value: value.to_string(),
    })
}

/// Apply the org filter, drop duplicate pairs (first wins), then cap at
/// `max_runs` (0 = no cap).
pub fn select_rows(rows: Vec<CsvRow>, org_filter: Option<Uuid>, max_runs: usize) -> Vec<CsvRow> {
    let mut seen = HashSet::new();
    let selected = rows
        .into_iter()
        .filter(|r| org_filter.map_or(true, |org| r.org_id == org))
        .filter(|r| seen.insert((r.org_id, r.question_run_id)));

    if max_runs > 0 {
        selected.take(max_runs).collect()
    } else {
        selected.collect()
    }
}

/// One job per row. Rows whose question run does not exist become
/// missing-run jobs so they are counted, not dropped.
pub async fn build_jobs(store: &dyn EvalStore, rows: &[CsvRow]) -> Result<Vec<EvaluationJob>> {
    let ids: Vec<Uuid> = rows
        .iter()
        .map(|r| r.question_run_id)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let mut runs: HashMap<Uuid, QuestionRun> = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(RUN_LOOKUP_CHUNK) {
        for run in store.question_runs_by_ids(chunk).await? {
            runs.insert(run.question_run_id, run);
        }
    }

    let missing = rows
        .iter()
        .filter(|r| !runs.contains_key(&r.question_run_id))
        .count();
    if missing > 0 {
        warn!(missing, "Question runs listed in the CSV were not found");
    }

    Ok(rows
        .iter()
        .map(|r| match runs.get(&r.question_run_id) {
            Some(run) => EvaluationJob::from_run(run, r.org_id),
            None => EvaluationJob::missing(r.question_run_id, r.org_id),
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub org_filter: Option<Uuid>,
    pub max_runs: usize,
    pub dry_run: bool,
    pub mode: PersistMode,
    pub scheduler: SchedulerConfig,
    pub placeholder: String,
}

/// Evaluate every selected row. Per-job failures are counted in the
/// returned totals; only lookup of the question runs can fail the call.
pub async fn run_backfill(
    store: Arc<dyn EvalStore>,
    directory: Arc<dyn OrgDirectory>,
    evaluator: Arc<dyn OrgEvaluator>,
    rows: Vec<CsvRow>,
    options: &BackfillOptions,
    cancel: CancellationToken,
) -> Result<RunTotals> {
    let rows = select_rows(rows, options.org_filter, options.max_runs);
    if rows.is_empty() {
        info!("No matching rows after filtering");
        return Ok(RunTotals::default());
    }

    info!(
        rows = rows.len(),
        dry_run = options.dry_run,
        max_runs = options.max_runs,
        concurrency = options.scheduler.concurrency,
        mode = ?options.mode,
        "Starting backfill"
    );
    if options.dry_run {
        info!("DRY RUN: no database writes and no model calls");
    }

    let jobs = build_jobs(store.as_ref(), &rows).await?;
    let processor = EvaluationProcessor::new(store, directory, evaluator, options.placeholder.clone())
        .with_mode(options.mode)
        .with_dry_run(options.dry_run);

    let totals = JobScheduler::new(options.scheduler)
        .run(jobs, Arc::new(processor), cancel)
        .await;
    totals.log_summary("backfill");
    Ok(totals)
}
