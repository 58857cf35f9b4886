//! Two-stage mention detection.
//!
//! Stage one is a case-insensitive substring test against the org's name
//! variations and must stay recall-biased: a response it rejects never
//! reaches stage two. Stage two asks the evaluator for a concrete mention
//! span and sentiment.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use brandlens_common::{EvaluationOutcome, OrgContext, Sentiment};

use crate::traits::{ExtractionCost, MentionExtraction, OrgEvaluator};

#[derive(Debug, Clone, PartialEq)]
pub enum SieveVerdict {
    /// The response is the failed-generation sentinel. Nothing was evaluated.
    FailedPlaceholder,
    /// No name variation occurs in the response.
    NoCandidate,
    /// The tight stage ran.
    Extracted {
        outcome: EvaluationOutcome,
        cost: ExtractionCost,
    },
}

impl SieveVerdict {
    pub fn outcome(&self) -> EvaluationOutcome {
        match self {
            SieveVerdict::Extracted { outcome, .. } => outcome.clone(),
            _ => EvaluationOutcome::not_mentioned(),
        }
    }

    pub fn cost(&self) -> ExtractionCost {
        match self {
            SieveVerdict::Extracted { cost, .. } => *cost,
            _ => ExtractionCost::default(),
        }
    }

    pub fn is_mentioned(&self) -> bool {
        matches!(self, SieveVerdict::Extracted { outcome, .. } if outcome.mentioned)
    }
}

pub struct MentionSieve {
    evaluator: Arc<dyn OrgEvaluator>,
    placeholder: String,
}

impl MentionSieve {
    pub fn new(evaluator: Arc<dyn OrgEvaluator>, placeholder: impl Into<String>) -> Self {
        Self {
            evaluator,
            placeholder: placeholder.into(),
        }
    }

    pub fn is_failed_placeholder(&self, response_text: &str) -> bool {
        brandlens_common::is_failed_placeholder(response_text, &self.placeholder)
    }

    pub async fn evaluate(&self, org: &OrgContext, response_text: &str) -> Result<SieveVerdict> {
        if self.is_failed_placeholder(response_text) {
            return Ok(SieveVerdict::FailedPlaceholder);
        }

        if !loose_match(response_text, &org.name_variations) {
            debug!(org = %org.org_id, "No name variation in response, skipping extraction");
            return Ok(SieveVerdict::NoCandidate);
        }

        let extraction = self.evaluator.extract_mention(org, response_text).await?;
        let cost = extraction.cost;

        Ok(SieveVerdict::Extracted {
            outcome: tighten(extraction, response_text),
            cost,
        })
    }
}

/// Case-insensitive containment of any non-blank variation.
pub fn loose_match(response_text: &str, name_variations: &[String]) -> bool {
    let haystack = response_text.to_lowercase();
    name_variations
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .any(|v| haystack.contains(&v.to_lowercase()))
}

/// Percentage of the response taken up by the mention, in characters.
pub fn share_of_voice(mention_text: &str, response_text: &str) -> f64 {
    let total = response_text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let mention = mention_text.chars().count();
    (100.0 * mention as f64 / total as f64).clamp(0.0, 100.0)
}

/// A loose hit without a verified, non-blank span is not a mention.
fn tighten(extraction: MentionExtraction, response_text: &str) -> EvaluationOutcome {
    let mention = extraction
        .mention_text
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());

    match mention {
        Some(text) if extraction.verified => EvaluationOutcome {
            mentioned: true,
            mention_text: Some(text.to_string()),
            sentiment: extraction.sentiment.as_deref().and_then(Sentiment::from_label),
            share_of_voice: share_of_voice(text, response_text),
        },
        _ => EvaluationOutcome::not_mentioned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variations(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn loose_match_is_case_insensitive_substring() {
        let v = variations(&["Acme", "Acme Corp"]);
        assert!(loose_match("we love ACME products", &v));
        assert!(loose_match("acmeville", &v));
        assert!(!loose_match("Globex wins", &v));
    }

    #[test]
    fn blank_or_missing_variations_never_match() {
        assert!(!loose_match("anything at all", &[]));
        assert!(!loose_match("anything at all", &variations(&["", "   "])));
    }

    #[test]
    fn share_of_voice_bounds() {
        assert_eq!(share_of_voice("Acme", ""), 0.0);
        assert_eq!(share_of_voice("Acme", "Acme"), 100.0);
        assert_eq!(share_of_voice("Acme Acme Acme", "Acme"), 100.0);

        let sov = share_of_voice("Acme Corp", "We use Acme Corp for everything");
        assert!((sov - 100.0 * 9.0 / 31.0).abs() < 1e-9);
    }

    #[test]
    fn unverified_or_blank_mentions_are_downgraded() {
        let response = "Acme is fine";
        let blank = MentionExtraction {
            verified: true,
            mention_text: Some("   ".into()),
            sentiment: Some("positive".into()),
            ..Default::default()
        };
        assert_eq!(tighten(blank, response), EvaluationOutcome::not_mentioned());

        let unverified = MentionExtraction {
            verified: false,
            mention_text: Some("Acme".into()),
            sentiment: Some("positive".into()),
            ..Default::default()
        };
        assert_eq!(tighten(unverified, response), EvaluationOutcome::not_mentioned());
    }

    #[test]
    fn verified_mention_keeps_sentiment() {
        let outcome = tighten(
            MentionExtraction {
                verified: true,
                mention_text: Some(" Acme ".into()),
                sentiment: Some("Negative".into()),
                ..Default::default()
            },
            "Acme is slow",
        );
        assert!(outcome.mentioned);
        assert_eq!(outcome.mention_text.as_deref(), Some("Acme"));
        assert_eq!(outcome.sentiment, Some(Sentiment::Negative));
        assert!(outcome.share_of_voice > 0.0 && outcome.share_of_voice <= 100.0);
    }

    #[test]
    fn only_the_exact_placeholder_is_the_sentinel() {
        use brandlens_common::FAILED_PROMPT_PLACEHOLDER;

        let sieve = MentionSieve::new(
            Arc::new(crate::testing::MockEvaluator::new()),
            FAILED_PROMPT_PLACEHOLDER,
        );
        assert!(sieve.is_failed_placeholder(FAILED_PROMPT_PLACEHOLDER));
        assert!(!sieve.is_failed_placeholder(&format!(" {FAILED_PROMPT_PLACEHOLDER} ")));
    }
}
