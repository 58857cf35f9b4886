use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::types::FAILED_PROMPT_PLACEHOLDER;

/// TOML-backed tunables. Every section is optional; a missing file is the
/// same as an empty one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub pipeline: PipelineConfig,
    pub models: ModelsConfig,
    pub billing: BillingConfig,
    /// Per-model token prices, keyed by model name.
    pub rates: HashMap<String, ModelRate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    /// Evaluation workers per run.
    pub concurrency: usize,
    /// Emit a progress line every N completed jobs.
    pub progress_every: usize,
    /// Concurrent text generations while executing a question matrix.
    pub question_concurrency: usize,
    /// Exact response text that marks a failed generation.
    pub failed_placeholder: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            progress_every: 50,
            question_concurrency: 5,
            failed_placeholder: FAILED_PROMPT_PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelsConfig {
    pub name_variations: String,
    pub mention: String,
    pub competitors: String,
    pub generation: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            name_variations: "gpt-4o-mini".to_string(),
            mention: "gpt-4o-mini".to_string(),
            competitors: "gpt-4o-mini".to_string(),
            generation: "gpt-4o".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BillingConfig {
    /// Price per question run when the partner has no fixed price.
    pub default_run_price: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_run_price: 0.10,
        }
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRate {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_million
            + f64::from(output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

impl FileConfig {
    /// Unknown models cost nothing rather than failing the extraction.
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or_default()
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => load_config(p),
            Some(p) => {
                tracing::warn!(path = %p.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.pipeline.concurrency, 20);
        assert_eq!(config.pipeline.progress_every, 50);
        assert_eq!(config.pipeline.failed_placeholder, FAILED_PROMPT_PLACEHOLDER);
        assert!((config.billing.default_run_price - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            [pipeline]
            concurrency = 4

            [rates."gpt-4o-mini"]
            input_per_million = 0.15
            output_per_million = 0.60
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.pipeline.progress_every, 50);
        let cost = config.rate_for("gpt-4o-mini").cost(1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
        assert_eq!(config.rate_for("unknown").cost(500, 500), 0.0);
    }

    #[test]
    fn shipped_config_parses() {
        let config: FileConfig =
            toml::from_str(include_str!("../../../config/brandlens.toml")).unwrap();
        assert_eq!(config.pipeline.question_concurrency, 5);
        assert!(config.rate_for("gpt-4o").cost(1_000, 1_000) > 0.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<FileConfig>("[pipeline]\nworkers = 3\n");
        assert!(err.is_err());
    }
}
