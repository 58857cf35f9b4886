use async_trait::async_trait;
use tracing::{error, warn};

use super::backend::AlertBackend;
use super::noop::NoopAlerts;
use super::slack::SlackWebhook;
use super::PipelineFailure;
use crate::stats::RunTotals;

/// Routes alerts to the configured sink, swallowing delivery errors.
pub struct AlertRouter {
    backend: Box<dyn AlertBackend>,
}

impl AlertRouter {
    pub fn new(backend: Box<dyn AlertBackend>) -> Self {
        Self { backend }
    }

    /// Slack when a webhook URL is configured, otherwise a no-op sink.
    pub fn from_webhook(webhook_url: Option<&str>) -> Self {
        match webhook_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => Self::new(Box::new(SlackWebhook::new(url.to_string()))),
            None => Self::new(Box::new(NoopAlerts)),
        }
    }
}

#[async_trait]
impl AlertBackend for AlertRouter {
    async fn send_failure(&self, failure: &PipelineFailure) -> anyhow::Result<()> {
        if let Err(e) = self.backend.send_failure(failure).await {
            warn!(error = %e, pipeline = %failure.pipeline, "Failed to send failure alert");
        }
        Ok(())
    }

    async fn send_digest(&self, label: &str, totals: &RunTotals) -> anyhow::Result<()> {
        if let Err(e) = self.backend.send_digest(label, totals).await {
            warn!(error = %e, label, "Failed to send digest alert");
        }
        Ok(())
    }
}

/// Log a workflow failure and forward it to the alert sink.
pub async fn report_failure(alerts: &dyn AlertBackend, failure: PipelineFailure) {
    error!(
        pipeline = %failure.pipeline,
        owner = %failure.owner_id_label(),
        owner_name = failure.owner_name_label(),
        reason = %failure.reason,
        error = %failure.error,
        "Pipeline failed"
    );
    if let Err(e) = alerts.send_failure(&failure).await {
        warn!(error = %e, "Failed to send failure alert");
    }
}
