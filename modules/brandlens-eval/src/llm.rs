//! OpenAI-backed evaluator and generator.

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info};

use ai_client::util::truncate_to_char_boundary;
use ai_client::{OpenAi, TokenUsage};
use brandlens_common::{FileConfig, OrgContext};

use crate::citations;
use crate::traits::{
    CompetitorExtraction, ExtractionCost, GeneratedText, MentionExtraction, OrgEvaluator,
    TextGenerator,
};

const MAX_RESPONSE_CHARS: usize = 30_000;

// ---------------------------------------------------------------------------
// Structured output types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
struct NameVariations {
    /// Realistic alternate names: abbreviations, legal names, domain-derived names.
    names: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MentionVerification {
    /// True only if the target organization itself is mentioned.
    is_mention_verified: bool,
    /// The exact sentence(s) mentioning the organization, copied verbatim.
    mention_text: Option<String>,
    /// "positive", "neutral" or "negative"
    sentiment: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompetitorList {
    /// Brand, product or company names other than the target organization.
    competitors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const NAME_VARIATIONS_PROMPT: &str = "You generate brand name variations. Given an \
organization name and its websites, list the names the organization realistically goes by: \
abbreviations, legal names, names without suffixes such as Inc or LLC, and names derived \
from the website domain. Do not include generic industry words or unrelated brands.";

const MENTION_PROMPT: &str = "You verify brand mentions. A preliminary check found one of \
the organization's name variations in the response below. Decide whether the TARGET \
ORGANIZATION itself is mentioned, not a generic word or a different entity with a similar \
name. If it is, copy the sentence(s) that mention it verbatim into mention_text and label the \
sentiment toward the organization as positive, neutral or negative. If it is not, set \
is_mention_verified to false and leave the other fields null.";

const COMPETITORS_PROMPT: &str = "You identify competitors. List every company, product, \
service, platform or tool named in the response that is NOT the target organization. Use \
the most recognizable name for each, remove duplicates, and exclude generic terms, \
technical concepts and industry words. Return an empty list if there are none.";

const GENERATION_PROMPT: &str = "Answer the user's question helpfully and concretely. \
When recommending companies, products or services, name them and cite sources as URLs.";

// ---------------------------------------------------------------------------
// LlmEvaluator
// ---------------------------------------------------------------------------

pub struct LlmEvaluator {
    openai: OpenAi,
    config: FileConfig,
}

impl LlmEvaluator {
    pub fn new(openai: OpenAi, config: FileConfig) -> Self {
        Self { openai, config }
    }

    fn cost(&self, model: &str, usage: TokenUsage) -> ExtractionCost {
        ExtractionCost {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_cost: self
                .config
                .rate_for(model)
                .cost(usage.input_tokens, usage.output_tokens),
        }
    }
}

fn org_block(org: &OrgContext) -> String {
    format!(
        "TARGET ORGANIZATION: {}\nWEBSITES: {}\nNAME VARIATIONS: {}",
        org.org_name,
        org.websites.join(", "),
        org.name_variations.join(", ")
    )
}

#[async_trait]
impl OrgEvaluator for LlmEvaluator {
    async fn name_variations(&self, org_name: &str, websites: &[String]) -> Result<Vec<String>> {
        let model = &self.config.models.name_variations;
        let user = format!("Organization: {org_name}\nWebsites: {}", websites.join(", "));

        let completion = self
            .openai
            .extract::<NameVariations>(model, 0.3, NAME_VARIATIONS_PROMPT, user)
            .await?;

        info!(
            org_name,
            variations = completion.value.names.len(),
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "Generated name variations"
        );
        Ok(completion.value.names)
    }

    async fn extract_mention(
        &self,
        org: &OrgContext,
        response_text: &str,
    ) -> Result<MentionExtraction> {
        let model = &self.config.models.mention;
        let user = format!(
            "{}\n\nRESPONSE:\n```\n{}\n```",
            org_block(org),
            truncate_to_char_boundary(response_text, MAX_RESPONSE_CHARS)
        );

        let completion = self
            .openai
            .extract::<MentionVerification>(model, 0.1, MENTION_PROMPT, user)
            .await?;
        let verification = completion.value;

        debug!(
            org = %org.org_id,
            verified = verification.is_mention_verified,
            "Mention verification"
        );
        Ok(MentionExtraction {
            verified: verification.is_mention_verified,
            mention_text: verification.mention_text,
            sentiment: verification.sentiment,
            cost: self.cost(model, completion.usage),
        })
    }

    async fn extract_competitors(
        &self,
        org: &OrgContext,
        response_text: &str,
    ) -> Result<CompetitorExtraction> {
        let model = &self.config.models.competitors;
        let user = format!(
            "TARGET ORGANIZATION: {}\n\nRESPONSE:\n```\n{}\n```",
            org.org_name,
            truncate_to_char_boundary(response_text, MAX_RESPONSE_CHARS)
        );

        let completion = self
            .openai
            .extract::<CompetitorList>(model, 0.1, COMPETITORS_PROMPT, user)
            .await?;

        Ok(CompetitorExtraction {
            names: completion.value.competitors,
            cost: self.cost(model, completion.usage),
        })
    }
}

// ---------------------------------------------------------------------------
// LlmGenerator
// ---------------------------------------------------------------------------

pub struct LlmGenerator {
    openai: OpenAi,
    config: FileConfig,
}

impl LlmGenerator {
    pub fn new(openai: OpenAi, config: FileConfig) -> Self {
        Self { openai, config }
    }
}

#[async_trait]
impl TextGenerator for LlmGenerator {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        location: Option<&str>,
    ) -> Result<GeneratedText> {
        let model = if model.is_empty() {
            self.config.models.generation.as_str()
        } else {
            model
        };
        let user = match location {
            Some(loc) if !loc.trim().is_empty() => format!("{prompt}\n\n(Answer for someone located in {loc}.)"),
            _ => prompt.to_string(),
        };

        let completion = self
            .openai
            .clone()
            .with_model(model)
            .chat_completion(GENERATION_PROMPT, user)
            .await?;
        let usage = completion.usage;
        let citations: Vec<String> = citations::find_urls(&completion.value)
            .into_iter()
            .map(str::to_string)
            .collect();

        Ok(GeneratedText {
            text: completion.value,
            cost: ExtractionCost {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_cost: self
                    .config
                    .rate_for(model)
                    .cost(usage.input_tokens, usage.output_tokens),
            },
            citations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_client::StructuredOutput;

    #[test]
    fn mention_schema_is_strict() {
        let schema = MentionVerification::openai_schema();
        assert_eq!(schema["additionalProperties"], false);
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 3);
    }

    #[test]
    fn org_block_lists_every_variation() {
        let org = crate::testing::acme_context();
        let block = org_block(&org);
        assert!(block.contains("TARGET ORGANIZATION: Acme"));
        assert!(block.contains("Acme, Acme Corp"));
        assert!(block.contains("https://acme.com"));
    }
}
