//! Outbound alerts for pipeline failures and run digests.

mod backend;
mod noop;
mod router;
mod slack;

pub use backend::AlertBackend;
pub use noop::NoopAlerts;
pub use router::{report_failure, AlertRouter};
pub use slack::SlackWebhook;

use uuid::Uuid;

/// An unrecoverable workflow failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub pipeline: String,
    pub owner_id: Option<Uuid>,
    pub owner_name: Option<String>,
    pub reason: String,
    pub error: String,
}

impl PipelineFailure {
    pub fn new(pipeline: impl Into<String>, reason: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            owner_id: None,
            owner_name: None,
            reason: reason.into(),
            error: error.into(),
        }
    }

    pub fn owner(mut self, owner_id: Uuid, owner_name: Option<String>) -> Self {
        self.owner_id = Some(owner_id);
        self.owner_name = owner_name;
        self
    }

    pub fn owner_id_label(&self) -> String {
        self.owner_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn owner_name_label(&self) -> &str {
        self.owner_name.as_deref().unwrap_or("unknown")
    }
}
