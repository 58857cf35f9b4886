//! Idempotent writes of evaluation, competitor and citation records.
//!
//! The three kinds are separate idempotency domains: each has its own
//! existence check, each is attempted even if another failed, and each is
//! skipped before any model call when rows already exist.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use brandlens_common::{Citation, Competitor, OrgContext, OrgEval};
use brandlens_store::{EvalStore, ExtractionPresence};

use crate::citations;
use crate::sieve::{MentionSieve, SieveVerdict};
use crate::traits::OrgEvaluator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistMode {
    /// Leave existing rows alone (forward fill).
    #[default]
    SkipExisting,
    /// Delete the pair's rows first, then evaluate from scratch.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalWrite {
    Created { mentioned: bool },
    /// Minimal record for a failed-generation response.
    Placeholder,
    SkippedExisting,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetWrite {
    Created(usize),
    /// Extraction ran and found nothing to store.
    Empty,
    SkippedExisting,
    /// Not attempted for placeholder responses.
    NotAttempted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistReport {
    pub eval: EvalWrite,
    pub competitors: SetWrite,
    pub citations: SetWrite,
}

impl PersistReport {
    pub fn has_failure(&self) -> bool {
        matches!(self.eval, EvalWrite::Failed(_))
            || matches!(self.competitors, SetWrite::Failed(_))
            || matches!(self.citations, SetWrite::Failed(_))
    }

    /// First failure message, for logging.
    pub fn failure(&self) -> Option<&str> {
        match (&self.eval, &self.competitors, &self.citations) {
            (EvalWrite::Failed(e), _, _) => Some(e),
            (_, SetWrite::Failed(e), _) => Some(e),
            (_, _, SetWrite::Failed(e)) => Some(e),
            _ => None,
        }
    }
}

pub struct ExtractionPersister {
    store: Arc<dyn EvalStore>,
    evaluator: Arc<dyn OrgEvaluator>,
    sieve: MentionSieve,
    mode: PersistMode,
}

impl ExtractionPersister {
    pub fn new(
        store: Arc<dyn EvalStore>,
        evaluator: Arc<dyn OrgEvaluator>,
        placeholder: impl Into<String>,
    ) -> Self {
        let sieve = MentionSieve::new(evaluator.clone(), placeholder);
        Self {
            store,
            evaluator,
            sieve,
            mode: PersistMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PersistMode {
        self.mode
    }

    pub fn sieve(&self) -> &MentionSieve {
        &self.sieve
    }

    /// Record a failed-generation response without loading org context.
    pub async fn persist_placeholder(&self, question_run_id: Uuid, org_id: Uuid) -> Result<PersistReport> {
        let presence = self.prepare(question_run_id, org_id).await?;
        Ok(self.write_placeholder(question_run_id, org_id, presence).await)
    }

    pub async fn persist(
        &self,
        org: &OrgContext,
        question_run_id: Uuid,
        response_text: &str,
    ) -> Result<PersistReport> {
        let presence = self.prepare(question_run_id, org.org_id).await?;

        if self.sieve.is_failed_placeholder(response_text) {
            return Ok(self.write_placeholder(question_run_id, org.org_id, presence).await);
        }

        let eval = if presence.eval {
            debug!(org = %org.org_id, run = %question_run_id, "Evaluation exists, skipping");
            EvalWrite::SkippedExisting
        } else {
            self.write_eval(org, question_run_id, response_text)
                .await
                .unwrap_or_else(|e| EvalWrite::Failed(format!("evaluation: {e:#}")))
        };

        let competitors = if presence.competitors {
            SetWrite::SkippedExisting
        } else {
            self.write_competitors(org, question_run_id, response_text)
                .await
                .unwrap_or_else(|e| SetWrite::Failed(format!("competitors: {e:#}")))
        };

        let citations = if presence.citations {
            SetWrite::SkippedExisting
        } else {
            self.write_citations(org, question_run_id, response_text)
                .await
                .unwrap_or_else(|e| SetWrite::Failed(format!("citations: {e:#}")))
        };

        Ok(PersistReport {
            eval,
            competitors,
            citations,
        })
    }

    async fn prepare(&self, question_run_id: Uuid, org_id: Uuid) -> Result<ExtractionPresence> {
        if self.mode == PersistMode::Replace {
            let deleted = self.store.delete_extractions(question_run_id, org_id).await?;
            debug!(org = %org_id, run = %question_run_id, deleted, "Cleared extractions for re-evaluation");
        }
        self.store.extraction_presence(question_run_id, org_id).await
    }

    async fn write_placeholder(
        &self,
        question_run_id: Uuid,
        org_id: Uuid,
        presence: ExtractionPresence,
    ) -> PersistReport {
        let eval = if presence.eval {
            EvalWrite::SkippedExisting
        } else {
            match self.store.create_org_eval(&OrgEval::minimal(question_run_id, org_id)).await {
                Ok(true) => EvalWrite::Placeholder,
                Ok(false) => EvalWrite::SkippedExisting,
                Err(e) => EvalWrite::Failed(format!("evaluation: {e:#}")),
            }
        };

        PersistReport {
            eval,
            competitors: SetWrite::NotAttempted,
            citations: SetWrite::NotAttempted,
        }
    }

    async fn write_eval(
        &self,
        org: &OrgContext,
        question_run_id: Uuid,
        response_text: &str,
    ) -> Result<EvalWrite> {
        let verdict = self.sieve.evaluate(org, response_text).await?;
        let cost = verdict.cost();

        let record = match &verdict {
            SieveVerdict::Extracted { outcome, .. } if outcome.mentioned => {
                let cited = citations::has_primary_citation(response_text, &org.websites);
                OrgEval::from_outcome(question_run_id, org.org_id, outcome, cited)
            }
            _ => OrgEval::minimal(question_run_id, org.org_id),
        }
        .with_cost(cost.input_tokens, cost.output_tokens, cost.total_cost);

        let mentioned = record.mentioned;
        if !self.store.create_org_eval(&record).await? {
            warn!(org = %org.org_id, run = %question_run_id, "Evaluation written concurrently, keeping existing row");
            return Ok(EvalWrite::SkippedExisting);
        }
        Ok(EvalWrite::Created { mentioned })
    }

    async fn write_competitors(
        &self,
        org: &OrgContext,
        question_run_id: Uuid,
        response_text: &str,
    ) -> Result<SetWrite> {
        let extraction = self.evaluator.extract_competitors(org, response_text).await?;

        let mut seen = HashSet::new();
        let mut rows: Vec<Competitor> = extraction
            .names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.to_lowercase()))
            .map(|n| Competitor::new(question_run_id, org.org_id, n))
            .collect();

        // The extraction's spend is attributed to the first row of the set.
        if let Some(first) = rows.first_mut() {
            first.input_tokens = extraction.cost.input_tokens.try_into().unwrap_or(i32::MAX);
            first.output_tokens = extraction.cost.output_tokens.try_into().unwrap_or(i32::MAX);
            first.total_cost = extraction.cost.total_cost;
        }

        if rows.is_empty() {
            return Ok(SetWrite::Empty);
        }
        Ok(SetWrite::Created(self.store.create_competitors(&rows).await?))
    }

    async fn write_citations(
        &self,
        org: &OrgContext,
        question_run_id: Uuid,
        response_text: &str,
    ) -> Result<SetWrite> {
        let rows: Vec<Citation> = self
            .evaluator
            .extract_citations(org, response_text)
            .await?
            .into_iter()
            .map(|c| Citation::new(question_run_id, org.org_id, c.url, c.kind))
            .collect();

        if rows.is_empty() {
            return Ok(SetWrite::Empty);
        }
        Ok(SetWrite::Created(self.store.create_citations(&rows).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{acme_context, MockEvaluator};
    use brandlens_common::{CitationKind, FAILED_PROMPT_PLACEHOLDER};
    use brandlens_store::testing::MemoryStore;

    const RESPONSE: &str = "We use Acme Corp for everything, see https://acme.com/docs. Globex is an alternative.";

    fn persister(store: Arc<MemoryStore>, evaluator: Arc<MockEvaluator>) -> ExtractionPersister {
        ExtractionPersister::new(store, evaluator, FAILED_PROMPT_PLACEHOLDER)
    }

    #[tokio::test]
    async fn writes_all_three_kinds() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = Arc::new(
            MockEvaluator::new()
                .with_mention("Acme Corp", "positive")
                .with_competitors(&["Globex", " ", "globex", "Initech"]),
        );
        let org = acme_context();
        let run = Uuid::new_v4();

        let report = persister(store.clone(), evaluator.clone())
            .persist(&org, run, RESPONSE)
            .await
            .unwrap();

        assert_eq!(report.eval, EvalWrite::Created { mentioned: true });
        assert_eq!(report.competitors, SetWrite::Created(2));
        assert_eq!(report.citations, SetWrite::Created(1));

        let evals = store.evals();
        assert_eq!(evals.len(), 1);
        assert!(evals[0].citation);
        assert_eq!(evals[0].mention_text.as_deref(), Some("Acme Corp"));
        assert_eq!(store.citations()[0].kind, CitationKind::Primary);
    }

    #[tokio::test]
    async fn second_persist_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = Arc::new(MockEvaluator::new().with_mention("Acme Corp", "neutral"));
        let persister = persister(store.clone(), evaluator.clone());
        let org = acme_context();
        let run = Uuid::new_v4();

        persister.persist(&org, run, RESPONSE).await.unwrap();
        let again = persister.persist(&org, run, RESPONSE).await.unwrap();

        assert_eq!(again.eval, EvalWrite::SkippedExisting);
        assert_eq!(again.competitors, SetWrite::Empty);
        assert_eq!(again.citations, SetWrite::SkippedExisting);
        assert_eq!(store.evals().len(), 1);
        assert_eq!(evaluator.mention_calls(), 1);
    }

    #[tokio::test]
    async fn no_candidate_writes_minimal_eval_without_extraction() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = Arc::new(MockEvaluator::new().with_mention("Acme", "positive"));
        let org = acme_context();

        let report = persister(store.clone(), evaluator.clone())
            .persist(&org, Uuid::new_v4(), "Globex and Initech lead the market.")
            .await
            .unwrap();

        assert_eq!(report.eval, EvalWrite::Created { mentioned: false });
        assert_eq!(evaluator.mention_calls(), 0);
        let eval = &store.evals()[0];
        assert!(!eval.mentioned && !eval.citation);
        assert_eq!(eval.share_of_voice, 0.0);
    }

    #[tokio::test]
    async fn placeholder_skips_every_extraction() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = Arc::new(MockEvaluator::new().with_competitors(&["Globex"]));
        let org = acme_context();

        let report = persister(store.clone(), evaluator.clone())
            .persist(&org, Uuid::new_v4(), FAILED_PROMPT_PLACEHOLDER)
            .await
            .unwrap();

        assert_eq!(report.eval, EvalWrite::Placeholder);
        assert_eq!(report.competitors, SetWrite::NotAttempted);
        assert_eq!(report.citations, SetWrite::NotAttempted);
        assert_eq!(evaluator.total_calls(), 0);
        assert!(!store.evals()[0].mentioned);
    }

    #[tokio::test]
    async fn competitor_failure_does_not_block_other_kinds() {
        let store = Arc::new(MemoryStore::new().failing_competitor_creates());
        let evaluator = Arc::new(
            MockEvaluator::new()
                .with_mention("Acme Corp", "positive")
                .with_competitors(&["Globex"]),
        );

        let report = persister(store.clone(), evaluator)
            .persist(&acme_context(), Uuid::new_v4(), RESPONSE)
            .await
            .unwrap();

        assert!(report.has_failure());
        assert!(report.failure().unwrap().starts_with("competitors"));
        assert_eq!(report.eval, EvalWrite::Created { mentioned: true });
        assert_eq!(report.citations, SetWrite::Created(1));
    }

    #[tokio::test]
    async fn replace_mode_re_evaluates() {
        let store = Arc::new(MemoryStore::new());
        let org = acme_context();
        let run = Uuid::new_v4();

        let first = Arc::new(MockEvaluator::new());
        persister(store.clone(), first).persist(&org, run, RESPONSE).await.unwrap();
        assert!(!store.evals()[0].mentioned);

        let second = Arc::new(MockEvaluator::new().with_mention("Acme Corp", "positive"));
        let report = persister(store.clone(), second)
            .with_mode(PersistMode::Replace)
            .persist(&org, run, RESPONSE)
            .await
            .unwrap();

        assert_eq!(report.eval, EvalWrite::Created { mentioned: true });
        let evals = store.evals();
        assert_eq!(evals.len(), 1);
        assert!(evals[0].mentioned);
    }
}
