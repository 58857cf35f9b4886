//! Outbound work for other pipelines.
//!
//! The scheduler trigger only decides *what* should run; delivery goes
//! through a [`TaskQueue`] so the host can plug in its own transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_store::OrgDirectory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineTask {
    EvaluateOrg { org_id: Uuid },
    EvaluateNetwork { network_id: Uuid },
    /// Replace existing extractions for the given runs.
    ReevaluateOrg {
        org_id: Uuid,
        question_run_ids: Vec<Uuid>,
    },
}

impl PipelineTask {
    pub fn owner_id(&self) -> Uuid {
        match self {
            PipelineTask::EvaluateOrg { org_id } | PipelineTask::ReevaluateOrg { org_id, .. } => {
                *org_id
            }
            PipelineTask::EvaluateNetwork { network_id } => *network_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineTask::EvaluateOrg { .. } => "evaluate_org",
            PipelineTask::EvaluateNetwork { .. } => "evaluate_network",
            PipelineTask::ReevaluateOrg { .. } => "reevaluate_org",
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: PipelineTask) -> Result<()>;
}

/// In-process queue backed by a tokio channel.
pub struct ChannelTaskQueue {
    tx: mpsc::Sender<PipelineTask>,
}

impl ChannelTaskQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PipelineTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, task: PipelineTask) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|e| anyhow::anyhow!("task queue closed, dropped {}", e.0.kind()))
    }
}

/// Enqueue an evaluation for every active org and network. Returns the
/// number of tasks enqueued. A failed enqueue is logged and skipped.
pub async fn fan_out_scheduled(directory: &dyn OrgDirectory, queue: &dyn TaskQueue) -> Result<usize> {
    let org_ids = directory
        .active_org_ids()
        .await
        .context("Failed to list active orgs")?;
    let network_ids = directory
        .active_network_ids()
        .await
        .context("Failed to list active networks")?;

    let tasks = org_ids
        .into_iter()
        .map(|org_id| PipelineTask::EvaluateOrg { org_id })
        .chain(
            network_ids
                .into_iter()
                .map(|network_id| PipelineTask::EvaluateNetwork { network_id }),
        );

    let mut enqueued = 0;
    for task in tasks {
        let owner = task.owner_id();
        let kind = task.kind();
        match queue.enqueue(task).await {
            Ok(()) => enqueued += 1,
            Err(e) => warn!(owner = %owner, kind, error = %e, "Failed to enqueue task"),
        }
    }

    info!(enqueued, "Scheduled evaluations enqueued");
    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{network_details, org_details, MockDirectory};

    #[test]
    fn tasks_serialize_with_a_type_tag() {
        let id = Uuid::nil();
        let json = serde_json::to_value(PipelineTask::EvaluateOrg { org_id: id }).unwrap();
        assert_eq!(json["type"], "evaluate_org");
        assert_eq!(json["org_id"], id.to_string());

        let back: PipelineTask = serde_json::from_value(serde_json::json!({
            "type": "reevaluate_org",
            "org_id": id,
            "question_run_ids": [id],
        }))
        .unwrap();
        assert_eq!(
            back,
            PipelineTask::ReevaluateOrg {
                org_id: id,
                question_run_ids: vec![id]
            }
        );
    }

    #[tokio::test]
    async fn fan_out_enqueues_every_org_and_network() {
        let (a, b, net) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let directory = MockDirectory::new()
            .with_org(org_details(a, "Acme", &[]))
            .with_org(org_details(b, "Globex", &[]))
            .with_network(network_details(net, &[a, b], &[]));
        let (queue, mut rx) = ChannelTaskQueue::new(8);

        let enqueued = fan_out_scheduled(&directory, &queue).await.unwrap();
        assert_eq!(enqueued, 3);

        drop(queue);
        let mut received = Vec::new();
        while let Some(task) = rx.recv().await {
            received.push(task);
        }
        assert_eq!(received.len(), 3);
        assert!(received.contains(&PipelineTask::EvaluateNetwork { network_id: net }));
        assert!(received.contains(&PipelineTask::EvaluateOrg { org_id: a }));
    }

    #[tokio::test]
    async fn closed_queue_is_skipped_not_fatal() {
        let directory = MockDirectory::new().with_org(org_details(Uuid::new_v4(), "Acme", &[]));
        let (queue, rx) = ChannelTaskQueue::new(1);
        drop(rx);

        assert_eq!(fan_out_scheduled(&directory, &queue).await.unwrap(), 0);
    }
}
