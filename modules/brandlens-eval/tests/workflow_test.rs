//! Org workflow runs resumed after a crash, a failure, or cancellation.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use brandlens_common::{BatchScope, BatchStatus, Payer, QuestionRun, QuestionRunBatch};
use brandlens_eval::testing::{
    org_details, paid_account, question_run, MockEvaluator, MockGenerator, RecordingAlerts,
};
use brandlens_eval::{OrgEvaluationWorkflow, PipelineDeps};
use brandlens_store::testing::MemoryStore;
use brandlens_store::EvalStore;

fn deps(store: Arc<MemoryStore>, generator: Arc<MockGenerator>, alerts: Arc<RecordingAlerts>) -> Arc<PipelineDeps> {
    Arc::new(
        PipelineDeps::builder()
            .store(store.clone())
            .directory(store)
            .evaluator(Arc::new(
                MockEvaluator::new().with_mention("Acme Corp", "positive"),
            ))
            .generator(generator)
            .alerts(alerts)
            .build(),
    )
}

#[tokio::test]
async fn crashed_batch_resumes_without_regenerating_answered_cells() {
    let org_id = Uuid::new_v4();
    let details = org_details(org_id, "Acme", &["best crm?", "cheap crm?"]);

    let mut batch = QuestionRunBatch::pending(BatchScope::Org, org_id, 2, Utc::now());
    batch.status = BatchStatus::Running;
    batch.completed_questions = 1;
    let answered = QuestionRun {
        question_run_id: Uuid::new_v4(),
        question_id: details.questions[0].question_id,
        batch_id: Some(batch.batch_id),
        model: details.models[0].name.clone(),
        location_id: None,
        location: None,
        response_text: Some("Acme Corp leads.".to_string()),
        input_tokens: 10,
        output_tokens: 40,
        total_cost: 0.0005,
        created_at: Utc::now(),
    };
    let batch_id = batch.batch_id;

    let store = Arc::new(
        MemoryStore::new()
            .with_org(details, paid_account(org_id, Uuid::new_v4()))
            .with_balance(Payer::org(org_id), 10.0)
            .with_batch(batch)
            .with_run(answered),
    );
    let generator = Arc::new(MockGenerator::new("Acme Corp is cheap."));
    let alerts = Arc::new(RecordingAlerts::new());
    let workflow = OrgEvaluationWorkflow::new(deps(store.clone(), generator.clone(), alerts));

    let report = workflow.run(org_id, CancellationToken::new()).await.unwrap();

    assert!(report.resumed);
    assert_eq!(report.batch_id, batch_id);
    assert_eq!(report.runs_reused, 1);
    assert_eq!(report.runs_generated, 1);
    assert_eq!(generator.prompts(), vec!["cheap crm?".to_string()]);
    assert_eq!(store.evals().len(), 2);
    assert_eq!(report.charged, 2);

    let batch = store.batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_questions, 2);
}

#[tokio::test]
async fn cancelled_run_leaves_the_batch_open_for_the_next_invocation() {
    let org_id = Uuid::new_v4();
    let store = Arc::new(
        MemoryStore::new()
            .with_org(
                org_details(org_id, "Acme", &["best crm?"]),
                paid_account(org_id, Uuid::new_v4()),
            )
            .with_balance(Payer::org(org_id), 10.0),
    );
    let alerts = Arc::new(RecordingAlerts::new());
    let workflow = OrgEvaluationWorkflow::new(deps(
        store.clone(),
        Arc::new(MockGenerator::new("Acme Corp")),
        alerts.clone(),
    ));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = workflow.run(org_id, cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(store.batches()[0].status, BatchStatus::Running);
    assert!(store.runs().is_empty());
    assert!(store.ledger().is_empty());
    assert!(alerts.failures().is_empty());

    let resumed = workflow.run(org_id, CancellationToken::new()).await.unwrap();

    assert!(resumed.resumed);
    assert!(!resumed.cancelled);
    assert_eq!(resumed.batch_id, report.batch_id);
    assert_eq!(store.batches().len(), 1);
    assert_eq!(store.batches()[0].status, BatchStatus::Completed);
    assert_eq!(resumed.charged, 1);
}

#[tokio::test]
async fn failed_batch_from_earlier_today_is_resumed_with_its_runs() {
    let org_id = Uuid::new_v4();
    let details = org_details(org_id, "Acme", &["best crm?", "cheap crm?"]);

    let mut failed = QuestionRunBatch::pending(BatchScope::Org, org_id, 2, Utc::now());
    failed.status = BatchStatus::Failed;
    failed.started_at = Some(Utc::now());
    failed.completed_questions = 1;
    let failed_id = failed.batch_id;
    let mut answered = question_run(Some(failed_id), Some("Acme Corp leads."));
    answered.question_id = details.questions[0].question_id;
    answered.model = details.models[0].name.clone();

    let store = Arc::new(
        MemoryStore::new()
            .with_org(details, paid_account(org_id, Uuid::new_v4()))
            .with_balance(Payer::org(org_id), 10.0)
            .with_batch(failed)
            .with_run(answered),
    );
    let generator = Arc::new(MockGenerator::new("Acme Corp"));
    let workflow = OrgEvaluationWorkflow::new(deps(
        store.clone(),
        generator.clone(),
        Arc::new(RecordingAlerts::new()),
    ));

    let report = workflow.run(org_id, CancellationToken::new()).await.unwrap();

    assert_eq!(report.batch_id, failed_id);
    assert!(report.resumed);
    assert_eq!(report.runs_reused, 1);
    assert_eq!(generator.prompts(), vec!["cheap crm?".to_string()]);
    assert_eq!(store.batches().len(), 1);
    assert_eq!(store.batches()[0].status, BatchStatus::Completed);
    assert_eq!(store.batches()[0].completed_questions, 2);
}
