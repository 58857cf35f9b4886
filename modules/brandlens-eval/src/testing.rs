// Test mocks for the evaluation pipeline.
//
// One mock per capability boundary:
// - MockEvaluator (OrgEvaluator): scripted mention/competitor answers with call counters
// - MockDirectory (OrgDirectory): HashMap-based org details with a lookup counter
// - MockGenerator (TextGenerator): prompt-substring → answer, optional failures
// - RecordingAlerts (AlertBackend): keeps every alert for assertions
//
// Plus fixtures for the "Acme" org used across tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use brandlens_common::{
    BillingAccount, ModelTarget, NetworkDetails, OrgContext, OrgDetails, Question, QuestionRun,
};
use brandlens_store::OrgDirectory;

use crate::notify::{AlertBackend, PipelineFailure};
use crate::stats::RunTotals;
use crate::traits::{
    CompetitorExtraction, ExtractionCost, GeneratedText, MentionExtraction, OrgEvaluator,
    TextGenerator,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const ACME_ORG_ID: Uuid = Uuid::from_u128(0xacde_0000_0000_0000_0000_0000_0000_0001);

pub fn acme_context() -> OrgContext {
    OrgContext {
        org_id: ACME_ORG_ID,
        org_name: "Acme".to_string(),
        websites: vec!["https://acme.com".to_string()],
        name_variations: vec!["Acme".to_string(), "Acme Corp".to_string()],
    }
}

/// Org details with one model, no locations and the given questions.
pub fn org_details(org_id: Uuid, name: &str, questions: &[&str]) -> OrgDetails {
    OrgDetails {
        org_id,
        name: name.to_string(),
        websites: vec![format!("https://{}.com", name.to_lowercase())],
        models: vec![ModelTarget {
            model_id: Uuid::new_v4(),
            name: "gpt-4o".to_string(),
        }],
        locations: Vec::new(),
        questions: questions
            .iter()
            .map(|q| Question {
                question_id: Uuid::new_v4(),
                text: q.to_string(),
            })
            .collect(),
    }
}

pub fn network_details(network_id: Uuid, members: &[Uuid], questions: &[&str]) -> NetworkDetails {
    let template = org_details(network_id, "Network", questions);
    NetworkDetails {
        network_id,
        name: "Network".to_string(),
        member_org_ids: members.to_vec(),
        models: template.models,
        locations: template.locations,
        questions: template.questions,
    }
}

pub fn paid_account(org_id: Uuid, partner_id: Uuid) -> BillingAccount {
    BillingAccount {
        org_id,
        partner_id: Some(partner_id),
        is_free_tier: false,
        partner_run_price: None,
    }
}

pub fn question_run(batch_id: Option<Uuid>, response_text: Option<&str>) -> QuestionRun {
    QuestionRun {
        question_run_id: Uuid::new_v4(),
        question_id: Uuid::new_v4(),
        batch_id,
        model: "gpt-4o".to_string(),
        location_id: None,
        location: None,
        response_text: response_text.map(str::to_string),
        input_tokens: 0,
        output_tokens: 0,
        total_cost: 0.0,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// MockEvaluator
// ---------------------------------------------------------------------------

/// Scripted evaluator. Defaults: variations `["Acme", "Acme Corp"]`, an
/// unverified empty mention and no competitors.
pub struct MockEvaluator {
    variations: Vec<String>,
    mention: MentionExtraction,
    competitors: Vec<String>,
    cost: ExtractionCost,
    delay: Duration,
    fail_variations: bool,
    fail_mentions: bool,
    variation_calls: AtomicUsize,
    mention_calls: AtomicUsize,
    competitor_calls: AtomicUsize,
}

impl Default for MockEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self {
            variations: vec!["Acme".to_string(), "Acme Corp".to_string()],
            mention: MentionExtraction::default(),
            competitors: Vec::new(),
            cost: ExtractionCost::default(),
            delay: Duration::ZERO,
            fail_variations: false,
            fail_mentions: false,
            variation_calls: AtomicUsize::new(0),
            mention_calls: AtomicUsize::new(0),
            competitor_calls: AtomicUsize::new(0),
        }
    }

    /// Every tight extraction verifies `text` with the given sentiment label.
    pub fn with_mention(mut self, text: &str, sentiment: &str) -> Self {
        self.mention = MentionExtraction {
            verified: true,
            mention_text: Some(text.to_string()),
            sentiment: Some(sentiment.to_string()),
            cost: self.cost,
        };
        self
    }

    pub fn with_competitors(mut self, names: &[&str]) -> Self {
        self.competitors = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_variations(mut self, names: &[&str]) -> Self {
        self.variations = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Cost reported by every mention and competitor call.
    pub fn with_cost(mut self, input_tokens: u32, output_tokens: u32, total_cost: f64) -> Self {
        self.cost = ExtractionCost {
            input_tokens,
            output_tokens,
            total_cost,
        };
        self.mention.cost = self.cost;
        self
    }

    /// Sleep before answering any model call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_variations(mut self) -> Self {
        self.fail_variations = true;
        self
    }

    pub fn failing_mentions(mut self) -> Self {
        self.fail_mentions = true;
        self
    }

    pub fn variation_calls(&self) -> usize {
        self.variation_calls.load(Ordering::SeqCst)
    }

    pub fn mention_calls(&self) -> usize {
        self.mention_calls.load(Ordering::SeqCst)
    }

    pub fn competitor_calls(&self) -> usize {
        self.competitor_calls.load(Ordering::SeqCst)
    }

    /// Model calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.variation_calls() + self.mention_calls() + self.competitor_calls()
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl OrgEvaluator for MockEvaluator {
    async fn name_variations(&self, _org_name: &str, _websites: &[String]) -> Result<Vec<String>> {
        self.variation_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_variations {
            bail!("MockEvaluator: name variation generation failed");
        }
        Ok(self.variations.clone())
    }

    async fn extract_mention(
        &self,
        _org: &OrgContext,
        _response_text: &str,
    ) -> Result<MentionExtraction> {
        self.mention_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_mentions {
            bail!("MockEvaluator: mention extraction failed");
        }
        Ok(self.mention.clone())
    }

    async fn extract_competitors(
        &self,
        _org: &OrgContext,
        _response_text: &str,
    ) -> Result<CompetitorExtraction> {
        self.competitor_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(CompetitorExtraction {
            names: self.competitors.clone(),
            cost: self.cost,
        })
    }
}

// ---------------------------------------------------------------------------
// MockDirectory
// ---------------------------------------------------------------------------

/// HashMap-based directory. Unknown ids resolve to `None`.
#[derive(Default)]
pub struct MockDirectory {
    orgs: HashMap<Uuid, OrgDetails>,
    networks: HashMap<Uuid, NetworkDetails>,
    org_lookups: AtomicUsize,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_org(mut self, details: OrgDetails) -> Self {
        self.orgs.insert(details.org_id, details);
        self
    }

    pub fn with_network(mut self, details: NetworkDetails) -> Self {
        self.networks.insert(details.network_id, details);
        self
    }

    pub fn org_lookups(&self) -> usize {
        self.org_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrgDirectory for MockDirectory {
    async fn org_details(&self, org_id: Uuid) -> Result<Option<OrgDetails>> {
        self.org_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.orgs.get(&org_id).cloned())
    }

    async fn network_details(&self, network_id: Uuid) -> Result<Option<NetworkDetails>> {
        Ok(self.networks.get(&network_id).cloned())
    }

    async fn active_org_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.orgs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn active_network_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.networks.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Answers prompts by substring match, falling back to a default answer.
/// Prompts matching a `.failing_on()` substring return `Err`.
pub struct MockGenerator {
    default_answer: String,
    answers: Vec<(String, String)>,
    failures: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new(default_answer: &str) -> Self {
        Self {
            default_answer: default_answer.to_string(),
            answers: Vec::new(),
            failures: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on_prompt(mut self, needle: &str, answer: &str) -> Self {
        self.answers.push((needle.to_string(), answer.to_string()));
        self
    }

    pub fn failing_on(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _model: &str,
        _location: Option<&str>,
    ) -> Result<GeneratedText> {
        self.calls.lock().unwrap().push(prompt.to_string());

        if self.failures.iter().any(|f| prompt.contains(f.as_str())) {
            bail!("MockGenerator: generation failed for prompt {prompt:?}");
        }

        let text = self
            .answers
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| self.default_answer.clone());

        Ok(GeneratedText {
            text,
            cost: ExtractionCost {
                input_tokens: 10,
                output_tokens: 40,
                total_cost: 0.0005,
            },
            citations: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingAlerts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAlerts {
    failures: Mutex<Vec<PipelineFailure>>,
    digests: Mutex<Vec<(String, RunTotals)>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<PipelineFailure> {
        self.failures.lock().unwrap().clone()
    }

    pub fn digests(&self) -> Vec<(String, RunTotals)> {
        self.digests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertBackend for RecordingAlerts {
    async fn send_failure(&self, failure: &PipelineFailure) -> Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }

    async fn send_digest(&self, label: &str, totals: &RunTotals) -> Result<()> {
        self.digests
            .lock()
            .unwrap()
            .push((label.to_string(), totals.clone()));
        Ok(())
    }
}
