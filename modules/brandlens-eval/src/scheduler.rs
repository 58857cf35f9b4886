//! Bounded worker pool over a shared job queue.
//!
//! Exactly `concurrency` tasks pull from one queue until it drains. Results
//! flow back over a channel to the caller, which owns all counters. Job
//! failures never stop the pool.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use brandlens_common::EvaluationJob;

use crate::stats::{JobOutcome, RunTotals};

/// Processes one job end to end. Must not panic; panics are caught and
/// counted as failures.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &EvaluationJob, cancel: &CancellationToken) -> JobOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Log progress every N completed jobs. Zero disables progress lines.
    pub progress_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            progress_every: 50,
        }
    }
}

struct JobResult {
    org_id: Uuid,
    question_run_id: Uuid,
    outcome: JobOutcome,
}

type JobQueue = Arc<Mutex<VecDeque<EvaluationJob>>>;

pub struct JobScheduler {
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: SchedulerConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
        }
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub async fn run(
        &self,
        jobs: Vec<EvaluationJob>,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> RunTotals {
        let total = jobs.len();
        let workers = self.config.concurrency;
        let queue: JobQueue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let (tx, mut rx) = mpsc::channel::<JobResult>(workers * 2);

        info!(total, workers, "Starting evaluation jobs");

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker(
                    worker_id,
                    queue.clone(),
                    handler.clone(),
                    tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        drop(tx);

        let mut totals = RunTotals {
            total,
            ..Default::default()
        };

        while let Some(result) = rx.recv().await {
            match &result.outcome {
                JobOutcome::Failed(e) => {
                    warn!(org = %result.org_id, run = %result.question_run_id, error = %e, "Job failed");
                }
                JobOutcome::Persisted(report) => {
                    if let Some(e) = report.failure() {
                        warn!(org = %result.org_id, run = %result.question_run_id, error = %e, "Job partially failed");
                    }
                }
                JobOutcome::Cancelled => {
                    warn!(org = %result.org_id, run = %result.question_run_id, "Job cancelled before start");
                }
                _ => {}
            }

            totals.record(&result.outcome);

            let every = self.config.progress_every;
            if every > 0 && totals.processed % every == 0 {
                info!(
                    completed = totals.processed,
                    total,
                    created = totals.created,
                    skipped = totals.skipped_existing,
                    errors = totals.errors,
                    "progress"
                );
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        totals.not_processed = lock(&queue).len();
        if totals.not_processed > 0 {
            warn!(not_processed = totals.not_processed, "Run stopped with jobs still queued");
        }
        totals
    }
}

async fn worker(
    worker_id: usize,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    tx: mpsc::Sender<JobResult>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(job) = next_job(&queue) else {
            break;
        };

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled
        } else {
            AssertUnwindSafe(handler.handle(&job, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(worker_id, run = %job.question_run_id, "Job handler panicked");
                    JobOutcome::Failed("job handler panicked".to_string())
                })
        };

        let result = JobResult {
            org_id: job.org_id,
            question_run_id: job.question_run_id,
            outcome,
        };
        if tx.send(result).await.is_err() {
            break;
        }
    }
}

fn next_job(queue: &JobQueue) -> Option<EvaluationJob> {
    lock(queue).pop_front()
}

fn lock(queue: &JobQueue) -> std::sync::MutexGuard<'_, VecDeque<EvaluationJob>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run cancelled")]
pub struct Cancelled;

/// Race `fut` against cancellation. An already-cancelled token wins.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled.into()),
        result = fut => result,
    }
}
