//! Daily question-run batches: `pending → running → completed | failed`.
//!
//! One batch per owner (org or network) per UTC calendar day. Calling
//! [`BatchController::get_or_create`] again on the same day resumes the
//! existing batch instead of creating a duplicate, whatever its status.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use brandlens_common::{BatchScope, BatchStatus, QuestionRunBatch};
use brandlens_store::EvalStore;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch {0} not found")]
    NotFound(Uuid),

    #[error("batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("batch {batch_id} is {status}, progress needs a running batch")]
    NotRunning { batch_id: Uuid, status: BatchStatus },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchHandle {
    pub batch: QuestionRunBatch,
    /// `true` when today's batch already existed and is being resumed.
    pub is_existing: bool,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.batch.batch_id
    }
}

pub struct BatchController {
    store: Arc<dyn EvalStore>,
}

impl BatchController {
    pub fn new(store: Arc<dyn EvalStore>) -> Self {
        Self { store }
    }

    pub async fn get_or_create(
        &self,
        scope: BatchScope,
        owner_id: Uuid,
        total_questions: u32,
    ) -> Result<BatchHandle, BatchError> {
        self.get_or_create_at(scope, owner_id, total_questions, Utc::now())
            .await
    }

    /// Resume today's batch for the owner, or create a pending one.
    ///
    /// A batch that failed earlier today is returned too; [`Self::start`]
    /// reopens it so its question runs are reused.
    pub async fn get_or_create_at(
        &self,
        scope: BatchScope,
        owner_id: Uuid,
        total_questions: u32,
        now: DateTime<Utc>,
    ) -> Result<BatchHandle, BatchError> {
        let today = start_of_utc_day(now);

        if let Some(batch) = self.store.batch_created_since(scope, owner_id, today).await? {
            info!(
                batch = %batch.batch_id,
                %scope,
                owner = %owner_id,
                status = %batch.status,
                completed = batch.completed_questions,
                "Resuming today's batch"
            );
            return Ok(BatchHandle {
                batch,
                is_existing: true,
            });
        }

        let total = i32::try_from(total_questions).unwrap_or(i32::MAX);
        let batch = QuestionRunBatch::pending(scope, owner_id, total, now);
        self.store.create_batch(&batch).await?;
        info!(batch = %batch.batch_id, %scope, owner = %owner_id, total, "Created batch");

        Ok(BatchHandle {
            batch,
            is_existing: false,
        })
    }

    /// `pending | failed → running`. Already running or completed batches
    /// are left untouched. A reopened failed batch keeps its start time and
    /// counters.
    pub async fn start(&self, batch_id: Uuid) -> Result<QuestionRunBatch, BatchError> {
        let batch = self.load(batch_id).await?;
        let from = batch.status;
        match from {
            BatchStatus::Running | BatchStatus::Completed => return Ok(batch),
            BatchStatus::Failed => warn!(batch = %batch_id, "Reopening failed batch"),
            BatchStatus::Pending => {}
        }

        let moved = self
            .store
            .transition_batch(batch_id, from, BatchStatus::Running, Utc::now())
            .await?;
        if !moved {
            // Another invocation started it first; fall through to its state.
            let current = self.load(batch_id).await?;
            if current.status != BatchStatus::Running {
                return Err(BatchError::InvalidTransition {
                    batch_id,
                    from: current.status,
                    to: BatchStatus::Running,
                });
            }
            return Ok(current);
        }

        info!(batch = %batch_id, "Batch started");
        self.load(batch_id).await
    }

    /// Add to the progress counters of a running batch.
    pub async fn update_progress(
        &self,
        batch_id: Uuid,
        completed_delta: u32,
        failed_delta: u32,
    ) -> Result<(), BatchError> {
        if completed_delta == 0 && failed_delta == 0 {
            return Ok(());
        }
        let batch = self.load(batch_id).await?;
        if batch.status != BatchStatus::Running {
            return Err(BatchError::NotRunning {
                batch_id,
                status: batch.status,
            });
        }
        self.store
            .increment_batch_progress(batch_id, to_i32(completed_delta), to_i32(failed_delta))
            .await?;
        Ok(())
    }

    /// `running → completed` with final counts. Completing an already
    /// completed batch is a no-op.
    pub async fn complete(
        &self,
        batch_id: Uuid,
        total_processed: u32,
        total_failed: u32,
    ) -> Result<QuestionRunBatch, BatchError> {
        let batch = self.load(batch_id).await?;
        match batch.status {
            BatchStatus::Completed => return Ok(batch),
            BatchStatus::Running => {}
            from => {
                return Err(BatchError::InvalidTransition {
                    batch_id,
                    from,
                    to: BatchStatus::Completed,
                })
            }
        }

        let completed = self
            .store
            .complete_batch(batch_id, to_i32(total_processed), to_i32(total_failed), Utc::now())
            .await?;
        let batch = self.load(batch_id).await?;
        if !completed && batch.status != BatchStatus::Completed {
            return Err(BatchError::InvalidTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Completed,
            });
        }

        info!(
            batch = %batch_id,
            completed = batch.completed_questions,
            failed = batch.failed_questions,
            "Batch completed"
        );
        Ok(batch)
    }

    /// `running → failed`. Pending batches fail too, since the workflow may
    /// die before starting them.
    pub async fn fail(&self, batch_id: Uuid) -> Result<(), BatchError> {
        let batch = self.load(batch_id).await?;
        let from = batch.status;
        if from == BatchStatus::Failed {
            return Ok(());
        }
        if from == BatchStatus::Completed {
            return Err(BatchError::InvalidTransition {
                batch_id,
                from,
                to: BatchStatus::Failed,
            });
        }

        let moved = self
            .store
            .transition_batch(batch_id, from, BatchStatus::Failed, Utc::now())
            .await?;
        if !moved {
            let current = self.load(batch_id).await?;
            return Err(BatchError::InvalidTransition {
                batch_id,
                from: current.status,
                to: BatchStatus::Failed,
            });
        }

        warn!(batch = %batch_id, "Batch marked failed");
        Ok(())
    }

    async fn load(&self, batch_id: Uuid) -> Result<QuestionRunBatch, BatchError> {
        self.store
            .batch(batch_id)
            .await?
            .ok_or(BatchError::NotFound(batch_id))
    }
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(chrono::NaiveTime::MIN))
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brandlens_store::testing::MemoryStore;
    use chrono::Duration;

    fn controller() -> (Arc<MemoryStore>, BatchController) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), BatchController::new(store))
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn day_boundary_is_utc_midnight() {
        assert_eq!(
            start_of_utc_day(at("2026-03-04T23:59:59Z")),
            at("2026-03-04T00:00:00Z")
        );
        assert_eq!(
            start_of_utc_day(at("2026-03-04T01:30:00+05:00")),
            at("2026-03-03T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn same_day_resumes_without_resetting_progress() {
        let (store, batches) = controller();
        let owner = Uuid::new_v4();
        let morning = at("2026-03-04T08:00:00Z");

        let first = batches
            .get_or_create_at(BatchScope::Org, owner, 10, morning)
            .await
            .unwrap();
        assert!(!first.is_existing);
        batches.start(first.id()).await.unwrap();
        batches.update_progress(first.id(), 4, 1).await.unwrap();

        let again = batches
            .get_or_create_at(BatchScope::Org, owner, 10, morning + Duration::hours(6))
            .await
            .unwrap();
        assert!(again.is_existing);
        assert_eq!(again.id(), first.id());

        let restarted = batches.start(again.id()).await.unwrap();
        assert_eq!(restarted.completed_questions, 4);
        assert_eq!(restarted.failed_questions, 1);
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test]
    async fn next_day_creates_a_new_batch() {
        let (store, batches) = controller();
        let owner = Uuid::new_v4();

        let monday = batches
            .get_or_create_at(BatchScope::Network, owner, 3, at("2026-03-02T23:00:00Z"))
            .await
            .unwrap();
        let tuesday = batches
            .get_or_create_at(BatchScope::Network, owner, 3, at("2026-03-03T00:10:00Z"))
            .await
            .unwrap();

        assert!(!tuesday.is_existing);
        assert_ne!(monday.id(), tuesday.id());
        assert_eq!(store.batches().len(), 2);
    }

    #[tokio::test]
    async fn scopes_are_separate_owners() {
        let (_, batches) = controller();
        let owner = Uuid::new_v4();
        let now = Utc::now();

        let org = batches.get_or_create_at(BatchScope::Org, owner, 1, now).await.unwrap();
        let network = batches
            .get_or_create_at(BatchScope::Network, owner, 1, now)
            .await
            .unwrap();
        assert_ne!(org.id(), network.id());
    }

    #[tokio::test]
    async fn full_lifecycle_moves_latest_flag() {
        let (store, batches) = controller();
        let owner = Uuid::new_v4();

        let old = batches
            .get_or_create_at(BatchScope::Org, owner, 2, Utc::now() - Duration::days(1))
            .await
            .unwrap();
        batches.start(old.id()).await.unwrap();
        batches.complete(old.id(), 2, 0).await.unwrap();

        let today = batches.get_or_create(BatchScope::Org, owner, 2).await.unwrap();
        let started = batches.start(today.id()).await.unwrap();
        assert_eq!(started.status, BatchStatus::Running);
        assert!(started.started_at.is_some());

        let done = batches.complete(today.id(), 1, 1).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!((done.completed_questions, done.failed_questions), (1, 1));

        let all = store.batches();
        let old_row = all.iter().find(|b| b.batch_id == old.id()).unwrap();
        assert!(!old_row.is_latest);

        // Completing twice is harmless; reopening is not allowed.
        batches.complete(today.id(), 1, 1).await.unwrap();
        assert!(matches!(
            batches.update_progress(today.id(), 1, 0).await,
            Err(BatchError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn progress_requires_a_started_batch() {
        let (_, batches) = controller();
        let handle = batches
            .get_or_create(BatchScope::Org, Uuid::new_v4(), 5)
            .await
            .unwrap();

        let err = batches.update_progress(handle.id(), 1, 0).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::NotRunning {
                status: BatchStatus::Pending,
                ..
            }
        ));
        assert!(matches!(
            batches.complete(handle.id(), 0, 0).await,
            Err(BatchError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failed_batch_is_reopened_with_its_progress() {
        let (store, batches) = controller();
        let owner = Uuid::new_v4();

        let first = batches.get_or_create(BatchScope::Org, owner, 4).await.unwrap();
        let started = batches.start(first.id()).await.unwrap();
        batches.update_progress(first.id(), 3, 0).await.unwrap();
        batches.fail(first.id()).await.unwrap();

        let retry = batches.get_or_create(BatchScope::Org, owner, 4).await.unwrap();
        assert!(retry.is_existing);
        assert_eq!(retry.id(), first.id());
        assert_eq!(retry.batch.status, BatchStatus::Failed);
        assert_eq!(store.batches().len(), 1);

        let reopened = batches.start(retry.id()).await.unwrap();
        assert_eq!(reopened.status, BatchStatus::Running);
        assert_eq!(reopened.completed_questions, 3);
        assert_eq!(reopened.started_at, started.started_at);
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let (_, batches) = controller();
        assert!(matches!(
            batches.start(Uuid::new_v4()).await,
            Err(BatchError::NotFound(_))
        ));
    }
}
