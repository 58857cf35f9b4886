//! Process setup shared by the binaries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_client::OpenAi;
use brandlens_common::{AppConfig, FileConfig};
use brandlens_store::PgStore;

use crate::llm::{LlmEvaluator, LlmGenerator};
use crate::notify::AlertRouter;
use crate::workflows::PipelineDeps;

const DEFAULT_FILTER: &str = "brandlens_eval=info,brandlens_store=info,ai_client=warn";
const DB_MAX_CONNECTIONS: u32 = 20;

/// Human-readable logs by default, JSON lines when `LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub struct Runtime {
    pub app: AppConfig,
    pub file: FileConfig,
    pub store: Arc<PgStore>,
}

impl Runtime {
    pub async fn connect(config_path: Option<&Path>) -> Result<Self> {
        let app = AppConfig::from_env()?;
        let file = FileConfig::load_or_default(config_path)?;
        let store = Arc::new(PgStore::connect(&app.database_url, DB_MAX_CONNECTIONS).await?);
        info!("Connected to Postgres");
        Ok(Self { app, file, store })
    }

    /// An OpenAI client. Without a key only dry runs are possible, so the
    /// key is required unless `allow_missing_key` is set.
    pub fn openai(&self, allow_missing_key: bool) -> Result<OpenAi> {
        let key = match self.app.openai_api_key.as_deref() {
            Some(key) => key,
            None if allow_missing_key => "",
            None => self.app.require_openai_key()?,
        };
        let mut client = OpenAi::new(key, self.file.models.generation.clone());
        if let Some(url) = &self.app.openai_base_url {
            client = client.with_base_url(url.clone());
        }
        Ok(client)
    }

    pub fn evaluator(&self, allow_missing_key: bool) -> Result<Arc<LlmEvaluator>> {
        Ok(Arc::new(LlmEvaluator::new(
            self.openai(allow_missing_key)?,
            self.file.clone(),
        )))
    }

    pub fn pipeline_deps(&self) -> Result<PipelineDeps> {
        let openai = self.openai(false)?;
        let alerts = AlertRouter::from_webhook(self.app.slack_webhook_url.as_deref());

        Ok(PipelineDeps::builder()
            .store(self.store.clone())
            .directory(self.store.clone())
            .evaluator(Arc::new(LlmEvaluator::new(openai.clone(), self.file.clone())))
            .generator(Arc::new(LlmGenerator::new(openai, self.file.clone())))
            .alerts(Arc::new(alerts))
            .pipeline(self.file.pipeline.clone())
            .default_run_price(self.file.billing.default_run_price)
            .build())
    }
}

/// Cancelled on Ctrl-C or after the timeout.
pub fn cancel_after(timeout_secs: u64) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    if timeout_secs > 0 {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            warn!(timeout_secs, "Timeout reached, cancelling");
            token.cancel();
        });
    }
    cancel
}
