use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::backend::AlertBackend;
use super::PipelineFailure;
use crate::stats::RunTotals;

/// Slack incoming webhook alert backend.
pub struct SlackWebhook {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackWebhook {
    pub fn new(webhook_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { webhook_url, http }
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned non-success");
            anyhow::bail!("Slack webhook returned {status}");
        }

        Ok(())
    }
}

pub(crate) fn failure_text(failure: &PipelineFailure) -> String {
    format!(
        ":rotating_light: *Pipeline failed: {}*\n\
         *Owner:* {} `{}`\n\
         *Reason:* {}\n\n\
         ```{}```",
        failure.pipeline,
        failure.owner_name_label(),
        failure.owner_id_label(),
        failure.reason,
        failure.error,
    )
}

pub(crate) fn digest_text(label: &str, totals: &RunTotals) -> Option<String> {
    if totals.errors == 0 && totals.not_processed == 0 {
        return None;
    }

    let mut lines = vec![format!(":warning: *{label} finished with errors*")];
    lines.push(format!("  - Processed: {}/{}", totals.processed, totals.total));
    lines.push(format!("  - Errors: {}", totals.errors));
    if totals.cancelled > 0 {
        lines.push(format!("  - Cancelled before start: {}", totals.cancelled));
    }
    if totals.not_processed > 0 {
        lines.push(format!("  - Not processed: {}", totals.not_processed));
    }
    lines.push(format!(
        "_Created {} evaluations ({} mentioned), skipped {} existing_",
        totals.created, totals.mentioned, totals.skipped_existing
    ));
    Some(lines.join("\n"))
}

#[async_trait]
impl AlertBackend for SlackWebhook {
    async fn send_failure(&self, failure: &PipelineFailure) -> anyhow::Result<()> {
        let payload = json!({
            "text": failure_text(failure),
            "unfurl_links": false,
        });
        self.post(payload).await
    }

    async fn send_digest(&self, label: &str, totals: &RunTotals) -> anyhow::Result<()> {
        let Some(text) = digest_text(label, totals) else {
            return Ok(());
        };
        let payload = json!({
            "text": text,
            "unfurl_links": false,
        });
        self.post(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn failure_text_falls_back_to_unknown_owner() {
        let failure = PipelineFailure::new("org-evaluation", "batch start", "connection reset");
        let text = failure_text(&failure);
        assert!(text.contains("org-evaluation"));
        assert!(text.contains("*Owner:* unknown `unknown`"));
        assert!(text.contains("connection reset"));

        let id = Uuid::new_v4();
        let named = failure.owner(id, Some("Acme".into()));
        assert!(failure_text(&named).contains(&format!("Acme `{id}`")));
    }

    #[test]
    fn clean_runs_produce_no_digest() {
        let clean = RunTotals {
            total: 3,
            processed: 3,
            created: 3,
            ..Default::default()
        };
        assert!(digest_text("backfill", &clean).is_none());

        let noisy = RunTotals {
            errors: 2,
            not_processed: 1,
            ..clean
        };
        let text = digest_text("backfill", &noisy).unwrap();
        assert!(text.contains("Errors: 2"));
        assert!(text.contains("Not processed: 1"));
    }
}
