use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ParseEnumError;

/// Response text stored when a generation failed. Runs carrying it are
/// recorded but never evaluated or charged.
pub const FAILED_PROMPT_PLACEHOLDER: &str = "This prompt didn’t complete successfully due to a temporary AI model limitation. You were not charged for this prompt. We'll re-try in the next run.";

/// Exact match against the failure placeholder. An empty placeholder
/// matches nothing.
pub fn is_failed_placeholder(response_text: &str, placeholder: &str) -> bool {
    !placeholder.is_empty() && response_text == placeholder
}

macro_rules! str_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(ParseEnumError::new($kind, other)),
                }
            }
        }
    };
}

// --- Organizations ---------------------------------------------------------

/// Enrichment shared read-only by every job that references the org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgContext {
    pub org_id: Uuid,
    pub org_name: String,
    pub websites: Vec<String>,
    pub name_variations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub model_id: Uuid,
    /// Provider model name, e.g. `gpt-4o`.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: Uuid,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgDetails {
    pub org_id: Uuid,
    pub name: String,
    pub websites: Vec<String>,
    pub models: Vec<ModelTarget>,
    pub locations: Vec<Location>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDetails {
    pub network_id: Uuid,
    pub name: String,
    pub member_org_ids: Vec<Uuid>,
    pub models: Vec<ModelTarget>,
    pub locations: Vec<Location>,
    pub questions: Vec<Question>,
}

// --- Evaluation ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

str_enum!(Sentiment, "sentiment", {
    Positive => "positive",
    Neutral => "neutral",
    Negative => "negative",
});

impl Sentiment {
    /// Lenient parse of a model-produced label. Anything else is dropped.
    pub fn from_label(label: &str) -> Option<Self> {
        label.trim().to_ascii_lowercase().parse().ok()
    }
}

/// One question run to evaluate for one org.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationJob {
    pub question_run_id: Uuid,
    pub org_id: Uuid,
    /// `None` when the question run could not be found.
    pub response_text: Option<String>,
    pub location: Option<String>,
}

impl EvaluationJob {
    pub fn from_run(run: &QuestionRun, org_id: Uuid) -> Self {
        Self {
            question_run_id: run.question_run_id,
            org_id,
            response_text: Some(run.response_text.clone().unwrap_or_default()),
            location: run.location.clone(),
        }
    }

    pub fn missing(question_run_id: Uuid, org_id: Uuid) -> Self {
        Self {
            question_run_id,
            org_id,
            response_text: None,
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub mentioned: bool,
    pub mention_text: Option<String>,
    pub sentiment: Option<Sentiment>,
    /// Percentage in `[0, 100]`, zero whenever `mentioned` is false.
    pub share_of_voice: f64,
}

impl EvaluationOutcome {
    pub fn not_mentioned() -> Self {
        Self {
            mentioned: false,
            mention_text: None,
            sentiment: None,
            share_of_voice: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgEval {
    pub eval_id: Uuid,
    pub question_run_id: Uuid,
    pub org_id: Uuid,
    pub mentioned: bool,
    pub citation: bool,
    pub mention_text: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub share_of_voice: f64,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrgEval {
    /// `mentioned=false, citation=false` with no extraction cost.
    pub fn minimal(question_run_id: Uuid, org_id: Uuid) -> Self {
        Self::from_outcome(question_run_id, org_id, &EvaluationOutcome::not_mentioned(), false)
    }

    pub fn from_outcome(
        question_run_id: Uuid,
        org_id: Uuid,
        outcome: &EvaluationOutcome,
        citation: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            eval_id: Uuid::new_v4(),
            question_run_id,
            org_id,
            mentioned: outcome.mentioned,
            citation,
            mention_text: outcome.mention_text.clone(),
            sentiment: outcome.sentiment,
            share_of_voice: outcome.share_of_voice,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_cost(mut self, input_tokens: u32, output_tokens: u32, total_cost: f64) -> Self {
        self.input_tokens = saturating_i32(input_tokens);
        self.output_tokens = saturating_i32(output_tokens);
        self.total_cost = total_cost;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub competitor_id: Uuid,
    pub question_run_id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
}

impl Competitor {
    pub fn new(question_run_id: Uuid, org_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            competitor_id: Uuid::new_v4(),
            question_run_id,
            org_id,
            name: name.into(),
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationKind {
    /// Points at one of the org's own websites.
    Primary,
    Secondary,
}

str_enum!(CitationKind, "citation kind", {
    Primary => "primary",
    Secondary => "secondary",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub citation_id: Uuid,
    pub question_run_id: Uuid,
    pub org_id: Uuid,
    pub url: String,
    pub kind: CitationKind,
    pub created_at: DateTime<Utc>,
}

impl Citation {
    pub fn new(question_run_id: Uuid, org_id: Uuid, url: impl Into<String>, kind: CitationKind) -> Self {
        Self {
            citation_id: Uuid::new_v4(),
            question_run_id,
            org_id,
            url: url.into(),
            kind,
            created_at: Utc::now(),
        }
    }
}

// --- Question runs and batches ----------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRun {
    pub question_run_id: Uuid,
    pub question_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub model: String,
    pub location_id: Option<Uuid>,
    pub location: Option<String>,
    pub response_text: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
}

impl QuestionRun {
    /// Billable: a non-blank response that is not the failure placeholder.
    pub fn is_successful(&self, placeholder: &str) -> bool {
        match self.response_text.as_deref() {
            Some(text) => !text.trim().is_empty() && !is_failed_placeholder(text, placeholder),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchScope {
    Org,
    Network,
}

str_enum!(BatchScope, "batch scope", {
    Org => "org",
    Network => "network",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

str_enum!(BatchStatus, "batch status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Running)
                | (BatchStatus::Running, BatchStatus::Completed)
                | (BatchStatus::Running, BatchStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRunBatch {
    pub batch_id: Uuid,
    pub scope: BatchScope,
    pub owner_id: Uuid,
    pub status: BatchStatus,
    pub total_questions: i32,
    pub completed_questions: i32,
    pub failed_questions: i32,
    pub is_latest: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuestionRunBatch {
    pub fn pending(scope: BatchScope, owner_id: Uuid, total_questions: i32, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            scope,
            owner_id,
            status: BatchStatus::Pending,
            total_questions,
            completed_questions: 0,
            failed_questions: 0,
            is_latest: true,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// --- Billing ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayerKind {
    Org,
    Partner,
}

str_enum!(PayerKind, "payer kind", {
    Org => "ORG",
    Partner => "PARTNER",
});

/// The balance a charge is deducted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payer {
    pub kind: PayerKind,
    pub id: Uuid,
}

impl Payer {
    pub fn org(id: Uuid) -> Self {
        Self {
            kind: PayerKind::Org,
            id,
        }
    }

    pub fn partner(id: Uuid) -> Self {
        Self {
            kind: PayerKind::Partner,
            id,
        }
    }
}

impl fmt::Display for Payer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Billing facts about an org needed to price and route a charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub org_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub is_free_tier: bool,
    /// Fixed per-run price negotiated by the partner, if any.
    pub partner_run_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub entry_id: Uuid,
    pub org_id: Uuid,
    pub question_run_id: Uuid,
    pub scope: BatchScope,
    pub batch_id: Option<Uuid>,
    /// Negative: a debit against the payer's balance.
    pub amount: f64,
    pub payer: Payer,
    pub charged_at: DateTime<Utc>,
}

fn saturating_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
