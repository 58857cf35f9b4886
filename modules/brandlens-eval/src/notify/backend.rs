use async_trait::async_trait;

use super::PipelineFailure;
use crate::stats::RunTotals;

/// Pluggable alert sink.
#[async_trait]
pub trait AlertBackend: Send + Sync {
    /// Report a workflow that could not finish.
    async fn send_failure(&self, failure: &PipelineFailure) -> anyhow::Result<()>;

    /// Summarise a finished run. Implementations may stay quiet for clean runs.
    async fn send_digest(&self, label: &str, totals: &RunTotals) -> anyhow::Result<()>;
}
