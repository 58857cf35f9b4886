//! Repository seams for the evaluation pipeline.
//!
//! [`PgStore`](crate::PgStore) implements both traits against Postgres;
//! `testing::MemoryStore` implements them in memory.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use brandlens_common::{
    BatchScope, BatchStatus, BillingAccount, Citation, Competitor, NetworkDetails, OrgDetails,
    OrgEval, Payer, QuestionRun, QuestionRunBatch, UsageLedgerEntry,
};

/// Which extraction kinds already exist for a (question run, org) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionPresence {
    pub eval: bool,
    pub competitors: bool,
    pub citations: bool,
}

#[async_trait]
pub trait EvalStore: Send + Sync {
    // --- Extractions ---

    async fn extraction_presence(&self, question_run_id: Uuid, org_id: Uuid)
        -> Result<ExtractionPresence>;

    async fn org_evals_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<OrgEval>>;

    /// Insert an evaluation. Returns `false` if one already exists for the pair.
    async fn create_org_eval(&self, eval: &OrgEval) -> Result<bool>;

    async fn competitors_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<Competitor>>;

    /// Insert a competitor set all-or-nothing. Returns rows actually inserted.
    async fn create_competitors(&self, competitors: &[Competitor]) -> Result<usize>;

    async fn citations_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<Citation>>;

    /// Insert a citation set all-or-nothing. Returns rows actually inserted.
    async fn create_citations(&self, citations: &[Citation]) -> Result<usize>;

    /// Delete evaluation, competitor and citation rows for the pair.
    async fn delete_extractions(&self, question_run_id: Uuid, org_id: Uuid) -> Result<u64>;

    // --- Question runs ---

    async fn question_runs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<QuestionRun>>;

    async fn question_runs_for_batch(&self, batch_id: Uuid) -> Result<Vec<QuestionRun>>;

    async fn create_question_run(&self, run: &QuestionRun) -> Result<()>;

    // --- Batches ---

    async fn batch(&self, batch_id: Uuid) -> Result<Option<QuestionRunBatch>>;

    /// Most recent batch for the owner created at or after `since`.
    async fn batch_created_since(
        &self,
        scope: BatchScope,
        owner_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<QuestionRunBatch>>;

    async fn create_batch(&self, batch: &QuestionRunBatch) -> Result<()>;

    /// Compare-and-set the status. Stamps `started_at` on entering `running`
    /// (only if unset). Returns `false` when the batch was not in `from`.
    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Add to the progress counters.
    async fn increment_batch_progress(
        &self,
        batch_id: Uuid,
        completed_delta: i32,
        failed_delta: i32,
    ) -> Result<()>;

    /// `running → completed` with final counts; clears `is_latest` on every
    /// other batch of the same owner. Returns `false` when not running.
    async fn complete_batch(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // --- Billing ---

    async fn billing_account(&self, org_id: Uuid) -> Result<Option<BillingAccount>>;

    async fn balance(&self, payer: Payer) -> Result<f64>;

    async fn ledger_entry_exists(&self, org_id: Uuid, question_run_id: Uuid) -> Result<bool>;

    /// Insert the entry and debit the payer atomically. Returns `false` if
    /// the (org, question run) pair was already charged.
    async fn record_charge(&self, entry: &UsageLedgerEntry) -> Result<bool>;

    async fn ledger_entries_for(&self, org_id: Uuid) -> Result<Vec<UsageLedgerEntry>>;
}

/// Read access to org and network configuration.
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    async fn org_details(&self, org_id: Uuid) -> Result<Option<OrgDetails>>;

    async fn network_details(&self, network_id: Uuid) -> Result<Option<NetworkDetails>>;

    async fn active_org_ids(&self) -> Result<Vec<Uuid>>;

    async fn active_network_ids(&self) -> Result<Vec<Uuid>>;
}
