//! One evaluation job end to end: context lookup, sieve, persistence.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use brandlens_common::{EvaluationJob, OrgContext};
use brandlens_store::{EvalStore, OrgDirectory};

use crate::cache::OrgContextCache;
use crate::persister::{ExtractionPersister, PersistMode};
use crate::scheduler::{cancellable, JobHandler};
use crate::stats::{DryRunPlan, JobOutcome};
use crate::traits::OrgEvaluator;

pub struct EvaluationProcessor {
    cache: Arc<OrgContextCache>,
    directory: Arc<dyn OrgDirectory>,
    evaluator: Arc<dyn OrgEvaluator>,
    store: Arc<dyn EvalStore>,
    persister: ExtractionPersister,
    dry_run: bool,
}

impl EvaluationProcessor {
    pub fn new(
        store: Arc<dyn EvalStore>,
        directory: Arc<dyn OrgDirectory>,
        evaluator: Arc<dyn OrgEvaluator>,
        placeholder: impl Into<String>,
    ) -> Self {
        let persister = ExtractionPersister::new(store.clone(), evaluator.clone(), placeholder);
        Self {
            cache: Arc::new(OrgContextCache::new()),
            directory,
            evaluator,
            store,
            persister,
            dry_run: false,
        }
    }

    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.persister = self.persister.with_mode(mode);
        self
    }

    /// Log and count intended writes without touching the store or any model.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Share an org context cache with other processors in the same run.
    pub fn with_cache(mut self, cache: Arc<OrgContextCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<OrgContextCache> {
        &self.cache
    }

    async fn process(&self, job: &EvaluationJob, cancel: &CancellationToken) -> Result<JobOutcome> {
        let Some(text) = job.response_text.as_deref() else {
            debug!(org = %job.org_id, run = %job.question_run_id, "Question run not found");
            return Ok(JobOutcome::MissingRun);
        };
        if text.trim().is_empty() {
            debug!(org = %job.org_id, run = %job.question_run_id, "Empty response, skipping");
            return Ok(JobOutcome::EmptyResponse);
        }

        if self.dry_run {
            let plan = cancellable(cancel, self.plan(job, text)).await?;
            return Ok(JobOutcome::DryRun(plan));
        }

        if self.persister.sieve().is_failed_placeholder(text) {
            let report = cancellable(
                cancel,
                self.persister
                    .persist_placeholder(job.question_run_id, job.org_id),
            )
            .await?;
            return Ok(JobOutcome::Persisted(report));
        }

        let org = cancellable(cancel, self.org_context(job.org_id)).await?;
        let report = cancellable(
            cancel,
            self.persister.persist(&org, job.question_run_id, text),
        )
        .await?;
        Ok(JobOutcome::Persisted(report))
    }

    /// Cached org context, loading it on first use.
    pub async fn org_context(&self, org_id: Uuid) -> Result<Arc<OrgContext>> {
        let ctx = self
            .cache
            .get(org_id, || {
                load_org_context(self.directory.as_ref(), self.evaluator.as_ref(), org_id)
            })
            .await?;
        Ok(ctx)
    }

    async fn plan(&self, job: &EvaluationJob, text: &str) -> Result<DryRunPlan> {
        let placeholder = self.persister.sieve().is_failed_placeholder(text);
        let presence = match self.persister.mode() {
            PersistMode::Replace => Default::default(),
            PersistMode::SkipExisting => {
                self.store
                    .extraction_presence(job.question_run_id, job.org_id)
                    .await?
            }
        };

        let plan = DryRunPlan {
            placeholder,
            create_eval: !presence.eval,
            extract_competitors: !placeholder && !presence.competitors,
            extract_citations: !placeholder && !presence.citations,
        };
        info!(
            org = %job.org_id,
            run = %job.question_run_id,
            placeholder = plan.placeholder,
            create_eval = plan.create_eval,
            competitors = plan.extract_competitors,
            citations = plan.extract_citations,
            "dry run: would evaluate"
        );
        Ok(plan)
    }
}

#[async_trait]
impl JobHandler for EvaluationProcessor {
    async fn handle(&self, job: &EvaluationJob, cancel: &CancellationToken) -> JobOutcome {
        self.process(job, cancel)
            .await
            .unwrap_or_else(|e| JobOutcome::Failed(format!("{e:#}")))
    }
}

/// Fetch org details and generate name variations for the sieve.
pub async fn load_org_context(
    directory: &dyn OrgDirectory,
    evaluator: &dyn OrgEvaluator,
    org_id: Uuid,
) -> Result<OrgContext> {
    let details = directory
        .org_details(org_id)
        .await?
        .with_context(|| format!("org {org_id} not found"))?;

    let generated = evaluator
        .name_variations(&details.name, &details.websites)
        .await
        .with_context(|| format!("name variations for {}", details.name))?;
    let name_variations = merge_variations(&details.name, generated);

    info!(org = %org_id, name = %details.name, variations = name_variations.len(), "Loaded org context");

    Ok(OrgContext {
        org_id,
        org_name: details.name,
        websites: details.websites,
        name_variations,
    })
}

/// The org name first, then generated variations. Blank and
/// case-insensitive duplicate entries are dropped.
fn merge_variations(org_name: &str, generated: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    std::iter::once(org_name.to_string())
        .chain(generated)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(|v| seen.insert(v.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::{EvalWrite, SetWrite};
    use crate::testing::{org_details, MockDirectory, MockEvaluator};
    use brandlens_common::FAILED_PROMPT_PLACEHOLDER;
    use brandlens_store::testing::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        directory: Arc<MockDirectory>,
        evaluator: Arc<MockEvaluator>,
        org_id: Uuid,
    }

    fn fixture(evaluator: MockEvaluator) -> Fixture {
        let org_id = Uuid::new_v4();
        Fixture {
            store: Arc::new(MemoryStore::new()),
            directory: Arc::new(MockDirectory::new().with_org(org_details(org_id, "Acme", &[]))),
            evaluator: Arc::new(evaluator),
            org_id,
        }
    }

    impl Fixture {
        fn processor(&self) -> EvaluationProcessor {
            EvaluationProcessor::new(
                self.store.clone(),
                self.directory.clone(),
                self.evaluator.clone(),
                FAILED_PROMPT_PLACEHOLDER,
            )
        }

        fn job(&self, text: Option<&str>) -> EvaluationJob {
            EvaluationJob {
                question_run_id: Uuid::new_v4(),
                org_id: self.org_id,
                response_text: text.map(str::to_string),
                location: None,
            }
        }
    }

    #[test]
    fn org_name_leads_merged_variations() {
        let merged = merge_variations(
            "Acme",
            vec!["acme".into(), "  ".into(), " Acme Corp ".into(), "ACME CORP".into()],
        );
        assert_eq!(merged, vec!["Acme".to_string(), "Acme Corp".to_string()]);
    }

    #[tokio::test]
    async fn missing_and_empty_responses_skip_all_work() {
        let f = fixture(MockEvaluator::new());
        let processor = f.processor();
        let cancel = CancellationToken::new();

        assert_eq!(processor.handle(&f.job(None), &cancel).await, JobOutcome::MissingRun);
        assert_eq!(
            processor.handle(&f.job(Some("  \n")), &cancel).await,
            JobOutcome::EmptyResponse
        );
        assert_eq!(f.directory.org_lookups(), 0);
        assert_eq!(f.evaluator.total_calls(), 0);
    }

    #[tokio::test]
    async fn placeholder_never_loads_org_context() {
        let f = fixture(MockEvaluator::new());
        let outcome = f
            .processor()
            .handle(&f.job(Some(FAILED_PROMPT_PLACEHOLDER)), &CancellationToken::new())
            .await;

        let JobOutcome::Persisted(report) = outcome else {
            panic!("expected a persisted placeholder, got {outcome:?}");
        };
        assert_eq!(report.eval, EvalWrite::Placeholder);
        assert_eq!(report.competitors, SetWrite::NotAttempted);
        assert_eq!(f.directory.org_lookups(), 0);
        assert_eq!(f.evaluator.total_calls(), 0);
    }

    #[tokio::test]
    async fn jobs_for_one_org_share_a_single_context_load() {
        let f = fixture(MockEvaluator::new().with_mention("Acme Corp", "positive"));
        let processor = Arc::new(f.processor());
        let cancel = CancellationToken::new();

        let a = f.job(Some("We use Acme Corp for everything"));
        let b = f.job(Some("Acme Corp again"));
        let (ra, rb) = tokio::join!(processor.handle(&a, &cancel), processor.handle(&b, &cancel));

        assert!(matches!(ra, JobOutcome::Persisted(_)));
        assert!(matches!(rb, JobOutcome::Persisted(_)));
        assert_eq!(f.evaluator.variation_calls(), 1);
        assert_eq!(f.directory.org_lookups(), 1);
        assert_eq!(f.store.evals().len(), 2);
    }

    #[tokio::test]
    async fn unknown_org_is_a_job_failure() {
        let f = fixture(MockEvaluator::new());
        let mut job = f.job(Some("Acme is here"));
        job.org_id = Uuid::new_v4();

        let outcome = f.processor().handle(&job, &CancellationToken::new()).await;
        let JobOutcome::Failed(message) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("not found"));
        assert!(f.store.evals().is_empty());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_and_calls_no_model() {
        let f = fixture(MockEvaluator::new().with_mention("Acme", "positive"));
        let outcome = f
            .processor()
            .with_dry_run(true)
            .handle(&f.job(Some("Acme is great")), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            JobOutcome::DryRun(DryRunPlan {
                placeholder: false,
                create_eval: true,
                extract_competitors: true,
                extract_citations: true,
            })
        );
        assert!(f.store.evals().is_empty());
        assert_eq!(f.evaluator.total_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_extraction() {
        let f = fixture(
            MockEvaluator::new()
                .with_mention("Acme", "positive")
                .with_delay(std::time::Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = f.processor().handle(&f.job(Some("Acme is great")), &cancel).await;
        let JobOutcome::Failed(message) = outcome else {
            panic!("expected cancellation failure, got {outcome:?}");
        };
        assert!(message.contains("cancelled"));
        assert!(f.store.evals().is_empty());
    }
}
