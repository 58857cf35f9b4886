use anyhow::Result;
use async_trait::async_trait;

use brandlens_common::{CitationKind, OrgContext};

use crate::citations;

// ---------------------------------------------------------------------------
// Extraction results
// ---------------------------------------------------------------------------

/// Tokens and spend of one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtractionCost {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_cost: f64,
}

impl ExtractionCost {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_cost == 0.0
    }
}

/// Raw answer of the tight mention stage, before the sieve applies its rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MentionExtraction {
    pub verified: bool,
    pub mention_text: Option<String>,
    pub sentiment: Option<String>,
    pub cost: ExtractionCost,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompetitorExtraction {
    pub names: Vec<String>,
    pub cost: ExtractionCost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCitation {
    pub url: String,
    pub kind: CitationKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub cost: ExtractionCost,
    pub citations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Model-backed extraction over a single AI response.
#[async_trait]
pub trait OrgEvaluator: Send + Sync {
    /// Alternate textual forms of the org name used by the loose pre-filter.
    async fn name_variations(&self, org_name: &str, websites: &[String]) -> Result<Vec<String>>;

    /// Locate a concrete mention of the org and label its sentiment.
    async fn extract_mention(&self, org: &OrgContext, response_text: &str)
        -> Result<MentionExtraction>;

    /// Names of other brands the response recommends or compares against.
    async fn extract_competitors(
        &self,
        org: &OrgContext,
        response_text: &str,
    ) -> Result<CompetitorExtraction>;

    /// URLs cited by the response. Deterministic unless overridden.
    async fn extract_citations(
        &self,
        org: &OrgContext,
        response_text: &str,
    ) -> Result<Vec<ExtractedCitation>> {
        Ok(citations::extract_citations(response_text, &org.websites))
    }
}

/// Produces the AI answers that get evaluated.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, model: &str, location: Option<&str>)
        -> Result<GeneratedText>;
}
