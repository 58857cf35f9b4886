use async_trait::async_trait;

use super::backend::AlertBackend;
use super::PipelineFailure;
use crate::stats::RunTotals;

/// Discards every alert. Used when no webhook is configured.
pub struct NoopAlerts;

#[async_trait]
impl AlertBackend for NoopAlerts {
    async fn send_failure(&self, _failure: &PipelineFailure) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_digest(&self, _label: &str, _totals: &RunTotals) -> anyhow::Result<()> {
        Ok(())
    }
}
