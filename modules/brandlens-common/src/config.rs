use anyhow::{anyhow, Context, Result};

/// Secrets and environment-specific values. Tunables live in
/// [`crate::FileConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub slack_webhook_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            openai_base_url: non_empty_var("OPENAI_BASE_URL"),
            slack_webhook_url: non_empty_var("SLACK_WEBHOOK_URL"),
        };

        config.log_keys();
        Ok(config)
    }

    /// Live runs call the model provider; dry runs do not need a key.
    pub fn require_openai_key(&self) -> Result<&str> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))
    }

    fn log_keys(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        tracing::info!("  OPENAI_API_KEY: {}", preview_opt(&self.openai_api_key));
        tracing::info!("  OPENAI_BASE_URL: {}", preview_opt(&self.openai_base_url));
        tracing::info!("  SLACK_WEBHOOK_URL: {}", preview_opt(&self.slack_webhook_url));
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn preview(val: &str) -> String {
    let n = val
        .char_indices()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(val.len());
    format!("{}...({} chars)", &val[..n], val.len())
}

fn preview_opt(val: &Option<String>) -> String {
    match val {
        Some(v) => preview(v),
        None => "<not set>".to_string(),
    }
}

/// Keep scheme and host, drop credentials.
fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => match url.split_once("://") {
            Some((scheme, _)) => format!("{scheme}://***@{host}"),
            None => format!("***@{host}"),
        },
        None => preview(url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_prefix_and_length() {
        assert_eq!(preview("sk-abcdefgh"), "sk-ab...(11 chars)");
        assert_eq!(preview("abc"), "abc...(3 chars)");
    }

    #[test]
    fn database_credentials_are_redacted() {
        let shown = redact_url("postgres://user:secret@db:5432/brandlens");
        assert_eq!(shown, "postgres://***@db:5432/brandlens");
        assert!(!shown.contains("secret"));
    }
}
