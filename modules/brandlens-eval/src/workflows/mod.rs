//! Org and network evaluation workflows.
//!
//! Each workflow is a fixed sequence of typed steps: balance check →
//! get-or-create batch → start → org context → question matrix →
//! evaluation jobs → complete batch → usage tracking. A failing step marks
//! the batch failed and raises an alert; job-level errors are only counted.
//! Cancellation is not a failure: the batch stays open and the next
//! invocation resumes it.
//!
//! Every step is safe to re-run after a crash: batches resume by day,
//! question runs resume by (question, model, location), extractions and
//! ledger entries are idempotent per (question run, org).

pub mod matrix;
pub mod network;
pub mod org;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use brandlens_common::file_config::PipelineConfig;
use brandlens_store::{EvalStore, OrgDirectory};

use crate::batch::{BatchController, BatchError};
use crate::notify::{report_failure, AlertBackend, NoopAlerts, PipelineFailure};
use crate::scheduler::{JobScheduler, SchedulerConfig};
use crate::stats::RunTotals;
use crate::tasks::PipelineTask;
use crate::traits::{OrgEvaluator, TextGenerator};
use crate::usage::UsageLedger;

pub use network::NetworkEvaluationWorkflow;
pub use org::OrgEvaluationWorkflow;

/// Shared, long-lived resources for every workflow invocation.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub store: Arc<dyn EvalStore>,
    pub directory: Arc<dyn OrgDirectory>,
    pub evaluator: Arc<dyn OrgEvaluator>,
    pub generator: Arc<dyn TextGenerator>,
    #[builder(default = Arc::new(NoopAlerts) as Arc<dyn AlertBackend>)]
    pub alerts: Arc<dyn AlertBackend>,
    #[builder(default)]
    pub pipeline: PipelineConfig,
    #[builder(default = 0.10)]
    pub default_run_price: f64,
}

impl PipelineDeps {
    pub fn batches(&self) -> BatchController {
        BatchController::new(self.store.clone())
    }

    pub fn usage(&self) -> UsageLedger {
        UsageLedger::new(
            self.store.clone(),
            self.default_run_price,
            self.pipeline.failed_placeholder.clone(),
        )
    }

    pub fn scheduler(&self) -> JobScheduler {
        JobScheduler::new(SchedulerConfig {
            concurrency: self.pipeline.concurrency,
            progress_every: self.pipeline.progress_every,
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.pipeline.failed_placeholder
    }
}

/// Named workflow steps, used as the failure reason in alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadOwner,
    BalanceCheck,
    CreateBatch,
    StartBatch,
    LoadContext,
    LoadRuns,
    QuestionMatrix,
    CompleteBatch,
    TrackUsage,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::LoadOwner => "load owner",
            Step::BalanceCheck => "balance check",
            Step::CreateBatch => "create batch",
            Step::StartBatch => "start batch",
            Step::LoadContext => "load org context",
            Step::LoadRuns => "load question runs",
            Step::QuestionMatrix => "question matrix",
            Step::CompleteBatch => "complete batch",
            Step::TrackUsage => "track usage",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
#[error("{step} failed: {source:#}")]
pub struct WorkflowError {
    pub step: Step,
    #[source]
    pub source: anyhow::Error,
}

/// Attach the failing step to any error.
pub(crate) trait StepContext<T> {
    fn step(self, step: Step) -> Result<T, WorkflowError>;
}

impl<T, E: Into<anyhow::Error>> StepContext<T> for Result<T, E> {
    fn step(self, step: Step) -> Result<T, WorkflowError> {
        self.map_err(|e| WorkflowError {
            step,
            source: e.into(),
        })
    }
}

/// What one workflow invocation did.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowReport {
    pub owner_id: Uuid,
    pub batch_id: Uuid,
    /// Today's batch was already there.
    pub resumed: bool,
    /// Today's batch was already completed; only usage was settled.
    pub already_completed: bool,
    /// Stopped by cancellation; the batch was left open for a resume.
    pub cancelled: bool,
    pub runs_generated: usize,
    pub runs_reused: usize,
    pub runs_failed: usize,
    pub evaluation: RunTotals,
    pub charged: usize,
}

impl WorkflowReport {
    pub(crate) fn empty(owner_id: Uuid, batch_id: Uuid, resumed: bool) -> Self {
        Self {
            owner_id,
            batch_id,
            resumed,
            already_completed: false,
            cancelled: false,
            runs_generated: 0,
            runs_reused: 0,
            runs_failed: 0,
            evaluation: RunTotals::default(),
            charged: 0,
        }
    }

    pub(crate) fn left_open(mut self, stage: impl fmt::Display) -> Self {
        warn!(
            owner = %self.owner_id,
            batch = %self.batch_id,
            %stage,
            "Cancelled, batch left open for resume"
        );
        self.cancelled = true;
        self
    }
}

/// Mark the batch failed (if there is one) and raise an alert.
pub(crate) async fn handle_failure(
    deps: &PipelineDeps,
    pipeline: &str,
    owner_id: Uuid,
    owner_name: Option<String>,
    batch_id: Option<Uuid>,
    err: &WorkflowError,
) {
    if let Some(batch_id) = batch_id {
        match deps.batches().fail(batch_id).await {
            Ok(()) | Err(BatchError::InvalidTransition { .. }) => {}
            Err(e) => warn!(batch = %batch_id, error = %e, "Could not mark batch failed"),
        }
    }

    let failure = PipelineFailure::new(pipeline, err.step.to_string(), format!("{:#}", err.source))
        .owner(owner_id, owner_name);
    report_failure(deps.alerts.as_ref(), failure).await;
}

/// Run one queued task to completion. Failures have already been alerted
/// by the workflow; they are returned for the caller's own accounting.
pub async fn execute_task(
    deps: Arc<PipelineDeps>,
    task: PipelineTask,
    cancel: CancellationToken,
) -> Result<(), WorkflowError> {
    info!(kind = task.kind(), owner = %task.owner_id(), "Executing task");
    match task {
        PipelineTask::EvaluateOrg { org_id } => {
            OrgEvaluationWorkflow::new(deps).run(org_id, cancel).await?;
        }
        PipelineTask::EvaluateNetwork { network_id } => {
            NetworkEvaluationWorkflow::new(deps).run(network_id, cancel).await?;
        }
        PipelineTask::ReevaluateOrg {
            org_id,
            question_run_ids,
        } => {
            OrgEvaluationWorkflow::new(deps)
                .reevaluate(org_id, &question_run_ids, cancel)
                .await?;
        }
    }
    Ok(())
}

/// Runs in the matrix: questions × models × locations (at least one slot).
pub(crate) fn matrix_size(questions: usize, models: usize, locations: usize) -> u32 {
    let total = questions * models * locations.max(1);
    u32::try_from(total).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_size_counts_missing_locations_as_one() {
        assert_eq!(matrix_size(3, 2, 0), 6);
        assert_eq!(matrix_size(3, 2, 2), 12);
        assert_eq!(matrix_size(0, 2, 2), 0);
    }

    #[tokio::test]
    async fn tasks_dispatch_to_their_workflow() {
        use crate::testing::{org_details, paid_account, MockEvaluator, MockGenerator};
        use brandlens_common::Payer;
        use brandlens_store::testing::MemoryStore;

        let org_id = Uuid::new_v4();
        let store = Arc::new(
            MemoryStore::new()
                .with_org(
                    org_details(org_id, "Acme", &["best crm?"]),
                    paid_account(org_id, Uuid::new_v4()),
                )
                .with_balance(Payer::org(org_id), 1.0),
        );
        let deps = Arc::new(
            PipelineDeps::builder()
                .store(store.clone())
                .directory(store.clone())
                .evaluator(Arc::new(MockEvaluator::new()))
                .generator(Arc::new(MockGenerator::new("Acme is fine.")))
                .build(),
        );

        execute_task(deps.clone(), PipelineTask::EvaluateOrg { org_id }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.runs().len(), 1);

        let err = execute_task(
            deps,
            PipelineTask::EvaluateNetwork {
                network_id: Uuid::new_v4(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.step, Step::LoadOwner);
    }

    #[test]
    fn step_errors_name_the_step() {
        let err: Result<(), _> = Err(anyhow::anyhow!("db down")).step(Step::StartBatch);
        assert_eq!(err.unwrap_err().to_string(), "start batch failed: db down");
    }
}
