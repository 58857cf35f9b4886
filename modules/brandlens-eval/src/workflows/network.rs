use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_common::{BatchScope, BatchStatus, EvaluationJob, NetworkDetails};

use crate::processor::EvaluationProcessor;
use crate::scheduler::{cancellable, Cancelled};
use crate::usage::UsageLedger;
use crate::workflows::matrix::{plan_matrix, MatrixRunner};
use crate::workflows::{
    handle_failure, matrix_size, PipelineDeps, Step, StepContext, WorkflowError, WorkflowReport,
};

const PIPELINE: &str = "network-evaluation";

/// Daily evaluation of a network: one shared question matrix, evaluated
/// once per member org. Every member's partner is billed for every
/// successful run.
pub struct NetworkEvaluationWorkflow {
    deps: Arc<PipelineDeps>,
}

impl NetworkEvaluationWorkflow {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    pub async fn run(
        &self,
        network_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        let details = match self.load(network_id).await {
            Ok(details) => details,
            Err(e) => {
                handle_failure(&self.deps, PIPELINE, network_id, None, None, &e).await;
                return Err(e);
            }
        };

        let mut batch_id = None;
        let result = self.execute(&details, &mut batch_id, cancel).await;
        if let Err(e) = &result {
            handle_failure(
                &self.deps,
                PIPELINE,
                network_id,
                Some(details.name.clone()),
                batch_id,
                e,
            )
            .await;
        }
        result
    }

    async fn load(&self, network_id: Uuid) -> Result<NetworkDetails, WorkflowError> {
        let details = self
            .deps
            .directory
            .network_details(network_id)
            .await
            .and_then(|d| d.ok_or_else(|| anyhow!("network {network_id} not found")))
            .step(Step::LoadOwner)?;
        if details.member_org_ids.is_empty() {
            return Err(anyhow!("network {network_id} has no member orgs")).step(Step::LoadOwner);
        }
        Ok(details)
    }

    async fn execute(
        &self,
        details: &NetworkDetails,
        batch_id: &mut Option<Uuid>,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        let deps = &self.deps;
        let network_id = details.network_id;
        let members = &details.member_org_ids;
        let total = matrix_size(
            details.questions.len(),
            details.models.len(),
            details.locations.len(),
        );
        info!(
            network = %network_id,
            name = %details.name,
            members = members.len(),
            total,
            "Starting network evaluation"
        );

        let usage = deps.usage();
        usage
            .check_balance_many(members, total, BatchScope::Network)
            .await
            .step(Step::BalanceCheck)?;

        let batches = deps.batches();
        let handle = batches
            .get_or_create(BatchScope::Network, network_id, total)
            .await
            .step(Step::CreateBatch)?;
        *batch_id = Some(handle.id());

        let mut report = WorkflowReport::empty(network_id, handle.id(), handle.is_existing);
        if handle.batch.status == BatchStatus::Completed {
            info!(network = %network_id, batch = %handle.id(), "Today's batch already completed, settling usage");
            report.already_completed = true;
            report.charged = charge_members(&usage, members, handle.id()).await?;
            return Ok(report);
        }

        batches.start(handle.id()).await.step(Step::StartBatch)?;

        // One processor for every member so contexts are loaded once per org.
        let processor = EvaluationProcessor::new(
            deps.store.clone(),
            deps.directory.clone(),
            deps.evaluator.clone(),
            deps.placeholder(),
        );
        for &org_id in members {
            match cancellable(&cancel, processor.org_context(org_id)).await {
                Ok(_) => {}
                Err(e) if e.is::<Cancelled>() => return Ok(report.left_open(Step::LoadContext)),
                // Jobs for this member will fail and be counted.
                Err(e) => warn!(network = %network_id, org = %org_id, error = %e, "Member context unavailable"),
            }
        }

        let cells = plan_matrix(&details.questions, &details.models, &details.locations);
        let runner = MatrixRunner {
            store: deps.store.as_ref(),
            generator: deps.generator.as_ref(),
            batches: &batches,
            placeholder: deps.placeholder(),
            concurrency: deps.pipeline.question_concurrency,
        };
        let matrix = match runner.execute(handle.id(), cells, &cancel).await {
            Ok(matrix) => matrix,
            Err(e) if e.is::<Cancelled>() => return Ok(report.left_open(Step::QuestionMatrix)),
            Err(e) => return Err(e).step(Step::QuestionMatrix),
        };
        report.runs_generated = matrix.generated;
        report.runs_reused = matrix.reused;
        report.runs_failed = matrix.failed;

        let jobs: Vec<EvaluationJob> = members
            .iter()
            .flat_map(|&org_id| {
                matrix
                    .runs
                    .iter()
                    .map(move |run| EvaluationJob::from_run(run, org_id))
            })
            .collect();
        report.evaluation = deps
            .scheduler()
            .run(jobs, Arc::new(processor), cancel.clone())
            .await;
        report.evaluation.log_summary(PIPELINE);

        if cancel.is_cancelled() {
            return Ok(report.left_open("evaluation jobs"));
        }

        let successful = matrix.successful(deps.placeholder());
        let failed = matrix.runs.len() - successful;
        batches
            .complete(
                handle.id(),
                u32::try_from(successful).unwrap_or(u32::MAX),
                u32::try_from(failed).unwrap_or(u32::MAX),
            )
            .await
            .step(Step::CompleteBatch)?;

        report.charged = charge_members(&usage, members, handle.id()).await?;

        if let Err(e) = deps.alerts.send_digest(PIPELINE, &report.evaluation).await {
            warn!(error = %e, "Failed to send digest");
        }

        info!(
            network = %network_id,
            batch = %handle.id(),
            generated = report.runs_generated,
            evaluations = report.evaluation.processed,
            charged = report.charged,
            "Network evaluation complete"
        );
        Ok(report)
    }
}

/// Charge every member for the batch. Already charged runs are skipped, so
/// this is safe to repeat.
async fn charge_members(
    usage: &UsageLedger,
    members: &[Uuid],
    batch_id: Uuid,
) -> Result<usize, WorkflowError> {
    let mut charged = 0;
    for &org_id in members {
        charged += usage
            .track_batch_usage(org_id, batch_id, BatchScope::Network)
            .await
            .step(Step::TrackUsage)?;
    }
    Ok(charged)
}
