use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_common::{BatchScope, BatchStatus, EvaluationJob, OrgDetails};

use crate::persister::PersistMode;
use crate::processor::EvaluationProcessor;
use crate::scheduler::{cancellable, Cancelled};
use crate::stats::RunTotals;
use crate::workflows::matrix::{plan_matrix, MatrixRunner};
use crate::workflows::{
    handle_failure, matrix_size, PipelineDeps, Step, StepContext, WorkflowError, WorkflowReport,
};

const PIPELINE: &str = "org-evaluation";
const REEVAL_PIPELINE: &str = "org-reevaluation";

/// Daily evaluation of one org: answer its question matrix, evaluate every
/// answer for the org, bill the successful runs.
pub struct OrgEvaluationWorkflow {
    deps: Arc<PipelineDeps>,
}

impl OrgEvaluationWorkflow {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    pub async fn run(
        &self,
        org_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        let details = match self.load(org_id).await {
            Ok(details) => details,
            Err(e) => {
                handle_failure(&self.deps, PIPELINE, org_id, None, None, &e).await;
                return Err(e);
            }
        };

        let mut batch_id = None;
        let result = self.execute(&details, &mut batch_id, cancel).await;
        if let Err(e) = &result {
            handle_failure(
                &self.deps,
                PIPELINE,
                org_id,
                Some(details.name.clone()),
                batch_id,
                e,
            )
            .await;
        }
        result
    }

    async fn load(&self, org_id: Uuid) -> Result<OrgDetails, WorkflowError> {
        self.deps
            .directory
            .org_details(org_id)
            .await
            .and_then(|d| d.ok_or_else(|| anyhow::anyhow!("org {org_id} not found")))
            .step(Step::LoadOwner)
    }

    async fn execute(
        &self,
        details: &OrgDetails,
        batch_id: &mut Option<Uuid>,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WorkflowError> {
        let deps = &self.deps;
        let org_id = details.org_id;
        let total = matrix_size(
            details.questions.len(),
            details.models.len(),
            details.locations.len(),
        );
        info!(org = %org_id, name = %details.name, total, "Starting org evaluation");

        let usage = deps.usage();
        usage
            .check_balance(org_id, total, BatchScope::Org)
            .await
            .step(Step::BalanceCheck)?;

        let batches = deps.batches();
        let handle = batches
            .get_or_create(BatchScope::Org, org_id, total)
            .await
            .step(Step::CreateBatch)?;
        *batch_id = Some(handle.id());

        let mut report = WorkflowReport::empty(org_id, handle.id(), handle.is_existing);
        if handle.batch.status == BatchStatus::Completed {
            info!(org = %org_id, batch = %handle.id(), "Today's batch already completed, settling usage");
            report.already_completed = true;
            report.charged = usage
                .track_batch_usage(org_id, handle.id(), BatchScope::Org)
                .await
                .step(Step::TrackUsage)?;
            return Ok(report);
        }

        batches.start(handle.id()).await.step(Step::StartBatch)?;

        let processor = EvaluationProcessor::new(
            deps.store.clone(),
            deps.directory.clone(),
            deps.evaluator.clone(),
            deps.placeholder(),
        );
        match cancellable(&cancel, processor.org_context(org_id)).await {
            Ok(_) => {}
            Err(e) if e.is::<Cancelled>() => return Ok(report.left_open(Step::LoadContext)),
            Err(e) => return Err(e).step(Step::LoadContext),
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

        let jobs: Vec<EvaluationJob> = matrix
            .runs
            .iter()
            .map(|run| EvaluationJob::from_run(run, org_id))
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
            .complete(handle.id(), to_u32(successful), to_u32(failed))
            .await
            .step(Step::CompleteBatch)?;

        report.charged = usage
            .track_batch_usage(org_id, handle.id(), BatchScope::Org)
            .await
            .step(Step::TrackUsage)?;

        if let Err(e) = deps.alerts.send_digest(PIPELINE, &report.evaluation).await {
            warn!(error = %e, "Failed to send digest");
        }

        info!(
            org = %org_id,
            batch = %handle.id(),
            generated = report.runs_generated,
            reused = report.runs_reused,
            charged = report.charged,
            "Org evaluation complete"
        );
        Ok(report)
    }

    /// Re-run extraction for specific question runs, replacing whatever was
    /// stored. No batch is touched and nothing is charged.
    pub async fn reevaluate(
        &self,
        org_id: Uuid,
        question_run_ids: &[Uuid],
        cancel: CancellationToken,
    ) -> Result<RunTotals, WorkflowError> {
        let result = self.reevaluate_inner(org_id, question_run_ids, cancel).await;
        if let Err(e) = &result {
            handle_failure(&self.deps, REEVAL_PIPELINE, org_id, None, None, e).await;
        }
        result
    }

    async fn reevaluate_inner(
        &self,
        org_id: Uuid,
        question_run_ids: &[Uuid],
        cancel: CancellationToken,
    ) -> Result<RunTotals, WorkflowError> {
        let deps = &self.deps;
        let runs = deps
            .store
            .question_runs_by_ids(question_run_ids)
            .await
            .step(Step::LoadRuns)?;

        let mut jobs: Vec<EvaluationJob> = runs
            .iter()
            .map(|run| EvaluationJob::from_run(run, org_id))
            .collect();
        for &id in question_run_ids {
            if !runs.iter().any(|r| r.question_run_id == id) {
                jobs.push(EvaluationJob::missing(id, org_id));
            }
        }
        info!(org = %org_id, jobs = jobs.len(), "Re-evaluating question runs");

        let processor = EvaluationProcessor::new(
            deps.store.clone(),
            deps.directory.clone(),
            deps.evaluator.clone(),
            deps.placeholder(),
        )
        .with_mode(PersistMode::Replace);

        let totals = deps.scheduler().run(jobs, Arc::new(processor), cancel).await;
        totals.log_summary(REEVAL_PIPELINE);
        Ok(totals)
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        org_details, paid_account, question_run, MockEvaluator, MockGenerator, RecordingAlerts,
    };
    use brandlens_common::{Payer, QuestionRunBatch, FAILED_PROMPT_PLACEHOLDER};
    use chrono::Utc;
    use brandlens_store::testing::MemoryStore;
    use brandlens_store::EvalStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        evaluator: Arc<MockEvaluator>,
        alerts: Arc<RecordingAlerts>,
        workflow: OrgEvaluationWorkflow,
        org_id: Uuid,
    }

    fn fixture(balance: f64, generator: MockGenerator) -> Fixture {
        let org_id = Uuid::new_v4();
        let store = Arc::new(
            MemoryStore::new()
                .with_org(
                    org_details(org_id, "Acme", &["best crm?", "cheap crm?", "broken crm?"]),
                    paid_account(org_id, Uuid::new_v4()),
                )
                .with_balance(Payer::org(org_id), balance),
        );
        let evaluator = Arc::new(
            MockEvaluator::new()
                .with_variations(&["Acme Corp"])
                .with_mention("Acme Corp is popular.", "positive")
                .with_competitors(&["Globex"]),
        );
        let alerts = Arc::new(RecordingAlerts::new());
        let deps = PipelineDeps::builder()
            .store(store.clone())
            .directory(store.clone())
            .evaluator(evaluator.clone())
            .generator(Arc::new(generator))
            .alerts(alerts.clone())
            .build();

        Fixture {
            store,
            evaluator,
            alerts,
            workflow: OrgEvaluationWorkflow::new(Arc::new(deps)),
            org_id,
        }
    }

    #[tokio::test]
    async fn daily_run_evaluates_and_bills_successful_runs() {
        let f = fixture(
            10.0,
            MockGenerator::new("Acme Corp is popular. Globex too.").failing_on("broken"),
        );

        let report = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();

        assert_eq!(report.runs_generated, 3);
        assert_eq!(report.runs_failed, 1);
        assert_eq!(report.evaluation.created, 3);
        assert_eq!(report.evaluation.mentioned, 2);
        assert_eq!(report.evaluation.failed_placeholders, 1);
        assert_eq!(report.charged, 2);
        assert_eq!(f.evaluator.variation_calls(), 1);

        let batch = f.store.batch(report.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!((batch.completed_questions, batch.failed_questions), (2, 1));

        let balance = f.store.balance_of(Payer::org(f.org_id)).unwrap();
        assert!((balance - 9.8).abs() < 1e-9);
        assert_eq!(f.alerts.digests().len(), 1);
        assert!(f.alerts.failures().is_empty());
    }

    #[tokio::test]
    async fn second_run_same_day_is_a_no_op() {
        let f = fixture(10.0, MockGenerator::new("Acme Corp is popular."));

        let first = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();
        let second = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();

        assert_eq!(first.batch_id, second.batch_id);
        assert!(second.resumed);
        assert!(second.already_completed);
        assert_eq!(f.store.runs().len(), 3);
        assert_eq!(f.store.ledger().len(), 3);
    }

    #[tokio::test]
    async fn completed_batch_still_settles_uncharged_runs() {
        let f = fixture(10.0, MockGenerator::new("Acme Corp is popular."));
        let mut batch = QuestionRunBatch::pending(BatchScope::Org, f.org_id, 3, Utc::now());
        batch.status = BatchStatus::Completed;
        let batch_id = batch.batch_id;
        f.store.create_batch(&batch).await.unwrap();
        let run = question_run(Some(batch_id), Some("Acme Corp is popular."));
        f.store.create_question_run(&run).await.unwrap();

        let report = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();

        assert!(report.already_completed);
        assert_eq!(report.batch_id, batch_id);
        assert_eq!(report.charged, 1);
        assert_eq!(f.store.ledger().len(), 1);
        assert_eq!(f.store.runs().len(), 1);

        let again = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();
        assert_eq!(again.charged, 0);
        assert_eq!(f.store.ledger().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_credits_stop_before_any_batch() {
        let f = fixture(0.05, MockGenerator::new("Acme Corp is popular."));

        let err = f
            .workflow
            .run(f.org_id, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.step, Step::BalanceCheck);
        assert!(f.store.batches().is_empty());
        let failures = f.alerts.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, "balance check");
        assert_eq!(failures[0].owner_name.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn store_failure_marks_batch_failed_and_alerts() {
        let org_id = Uuid::new_v4();
        let store = Arc::new(
            MemoryStore::new()
                .with_org(
                    org_details(org_id, "Acme", &["best crm?"]),
                    paid_account(org_id, Uuid::new_v4()),
                )
                .with_balance(Payer::org(org_id), 10.0)
                .failing_run_creates(),
        );
        let alerts = Arc::new(RecordingAlerts::new());
        let deps = PipelineDeps::builder()
            .store(store.clone())
            .directory(store.clone())
            .evaluator(Arc::new(MockEvaluator::new()))
            .generator(Arc::new(MockGenerator::new("answer")))
            .alerts(alerts.clone())
            .build();
        let workflow = OrgEvaluationWorkflow::new(Arc::new(deps));

        let err = workflow.run(org_id, CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.step, Step::QuestionMatrix);
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchStatus::Failed);
        assert_eq!(alerts.failures().len(), 1);
        assert!(store.ledger().is_empty());
    }

    #[tokio::test]
    async fn unknown_org_is_reported() {
        let f = fixture(10.0, MockGenerator::new("answer"));

        let err = f
            .workflow
            .run(Uuid::new_v4(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.step, Step::LoadOwner);
        assert_eq!(f.alerts.failures()[0].owner_name_label(), "unknown");
    }

    #[tokio::test]
    async fn reevaluation_replaces_without_billing() {
        let f = fixture(10.0, MockGenerator::new("Acme Corp is popular."));
        let report = f.workflow.run(f.org_id, CancellationToken::new()).await.unwrap();
        let ids: Vec<Uuid> = f.store.runs().iter().map(|r| r.question_run_id).collect();
        let ledger_before = f.store.ledger().len();

        let totals = f
            .workflow
            .reevaluate(f.org_id, &ids, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(totals.created, 3);
        assert_eq!(totals.skipped_existing, 0);
        assert_eq!(f.store.evals().len(), 3);
        assert_eq!(f.store.ledger().len(), ledger_before);
        assert_eq!(report.charged, ledger_before);
        assert!(f
            .store
            .runs()
            .iter()
            .all(|r| r.response_text.as_deref() != Some(FAILED_PROMPT_PLACEHOLDER)));
    }
}
