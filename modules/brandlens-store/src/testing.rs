// In-memory store for tests.
//
// MemoryStore implements both EvalStore and OrgDirectory behind one Mutex,
// with the same "at most one" rules as the Postgres schema. Builder methods
// seed orgs, networks, balances and runs; `failing_*` switches inject
// persistence errors.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use brandlens_common::{
    BatchScope, BatchStatus, BillingAccount, Citation, Competitor, NetworkDetails, OrgDetails,
    OrgEval, Payer, QuestionRun, QuestionRunBatch, UsageLedgerEntry,
};

use crate::traits::{EvalStore, ExtractionPresence, OrgDirectory};

#[derive(Default)]
struct Inner {
    orgs: HashMap<Uuid, OrgDetails>,
    networks: HashMap<Uuid, NetworkDetails>,
    accounts: HashMap<Uuid, BillingAccount>,
    balances: HashMap<Payer, f64>,
    runs: Vec<QuestionRun>,
    batches: Vec<QuestionRunBatch>,
    evals: Vec<OrgEval>,
    competitors: Vec<Competitor>,
    citations: Vec<Citation>,
    ledger: Vec<UsageLedgerEntry>,
    fail_eval_creates: bool,
    fail_competitor_creates: bool,
    fail_run_creates: bool,
    eval_create_calls: usize,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed an org with its billing account. Free-tier orgs still need a
    /// partner to pay for them.
    pub fn with_org(self, details: OrgDetails, account: BillingAccount) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.accounts.insert(details.org_id, account);
            inner.orgs.insert(details.org_id, details);
        }
        self
    }

    pub fn with_network(self, details: NetworkDetails) -> Self {
        self.inner
            .lock()
            .unwrap()
            .networks
            .insert(details.network_id, details);
        self
    }

    pub fn with_balance(self, payer: Payer, balance: f64) -> Self {
        self.inner.lock().unwrap().balances.insert(payer, balance);
        self
    }

    pub fn with_run(self, run: QuestionRun) -> Self {
        self.inner.lock().unwrap().runs.push(run);
        self
    }

    pub fn with_batch(self, batch: QuestionRunBatch) -> Self {
        self.inner.lock().unwrap().batches.push(batch);
        self
    }

    pub fn with_eval(self, eval: OrgEval) -> Self {
        self.inner.lock().unwrap().evals.push(eval);
        self
    }

    /// Make `create_org_eval` fail for every call.
    pub fn failing_eval_creates(self) -> Self {
        self.inner.lock().unwrap().fail_eval_creates = true;
        self
    }

    /// Make `create_competitors` fail for every call.
    pub fn failing_competitor_creates(self) -> Self {
        self.inner.lock().unwrap().fail_competitor_creates = true;
        self
    }

    /// Make `create_question_run` fail for every call.
    pub fn failing_run_creates(self) -> Self {
        self.inner.lock().unwrap().fail_run_creates = true;
        self
    }

    // --- Inspection ---

    pub fn evals(&self) -> Vec<OrgEval> {
        self.inner.lock().unwrap().evals.clone()
    }

    pub fn competitors(&self) -> Vec<Competitor> {
        self.inner.lock().unwrap().competitors.clone()
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.inner.lock().unwrap().citations.clone()
    }

    pub fn runs(&self) -> Vec<QuestionRun> {
        self.inner.lock().unwrap().runs.clone()
    }

    pub fn batches(&self) -> Vec<QuestionRunBatch> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn ledger(&self) -> Vec<UsageLedgerEntry> {
        self.inner.lock().unwrap().ledger.clone()
    }

    pub fn balance_of(&self, payer: Payer) -> Option<f64> {
        self.inner.lock().unwrap().balances.get(&payer).copied()
    }

    pub fn eval_create_calls(&self) -> usize {
        self.inner.lock().unwrap().eval_create_calls
    }
}

fn matches_pair(run: Uuid, org: Uuid) -> impl Fn(&(Uuid, Uuid)) -> bool {
    move |(r, o)| *r == run && *o == org
}

#[async_trait]
impl EvalStore for MemoryStore {
    async fn extraction_presence(
        &self,
        question_run_id: Uuid,
        org_id: Uuid,
    ) -> Result<ExtractionPresence> {
        let inner = self.inner.lock().unwrap();
        let is_pair = matches_pair(question_run_id, org_id);
        Ok(ExtractionPresence {
            eval: inner
                .evals
                .iter()
                .any(|e| is_pair(&(e.question_run_id, e.org_id))),
            competitors: inner
                .competitors
                .iter()
                .any(|c| is_pair(&(c.question_run_id, c.org_id))),
            citations: inner
                .citations
                .iter()
                .any(|c| is_pair(&(c.question_run_id, c.org_id))),
        })
    }

    async fn org_evals_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<OrgEval>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .evals
            .iter()
            .filter(|e| e.question_run_id == question_run_id && e.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn create_org_eval(&self, eval: &OrgEval) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.eval_create_calls += 1;
        if inner.fail_eval_creates {
            bail!("MemoryStore: create_org_eval forced failure");
        }
        let exists = inner
            .evals
            .iter()
            .any(|e| e.question_run_id == eval.question_run_id && e.org_id == eval.org_id);
        if exists {
            return Ok(false);
        }
        inner.evals.push(eval.clone());
        Ok(true)
    }

    async fn competitors_for(
        &self,
        question_run_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<Competitor>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .competitors
            .iter()
            .filter(|c| c.question_run_id == question_run_id && c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn create_competitors(&self, competitors: &[Competitor]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_competitor_creates {
            bail!("MemoryStore: create_competitors forced failure");
        }
        let mut inserted = 0;
        for c in competitors {
            let dup = inner.competitors.iter().any(|e| {
                e.question_run_id == c.question_run_id && e.org_id == c.org_id && e.name == c.name
            });
            if !dup {
                inner.competitors.push(c.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn citations_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<Citation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .citations
            .iter()
            .filter(|c| c.question_run_id == question_run_id && c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn create_citations(&self, citations: &[Citation]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0;
        for c in citations {
            let dup = inner.citations.iter().any(|e| {
                e.question_run_id == c.question_run_id && e.org_id == c.org_id && e.url == c.url
            });
            if !dup {
                inner.citations.push(c.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_extractions(&self, question_run_id: Uuid, org_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.evals.len() + inner.competitors.len() + inner.citations.len();
        inner
            .evals
            .retain(|e| !(e.question_run_id == question_run_id && e.org_id == org_id));
        inner
            .competitors
            .retain(|c| !(c.question_run_id == question_run_id && c.org_id == org_id));
        inner
            .citations
            .retain(|c| !(c.question_run_id == question_run_id && c.org_id == org_id));
        let after = inner.evals.len() + inner.competitors.len() + inner.citations.len();
        Ok((before - after) as u64)
    }

    async fn question_runs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<QuestionRun>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .iter()
            .filter(|r| ids.contains(&r.question_run_id))
            .cloned()
            .collect())
    }

    async fn question_runs_for_batch(&self, batch_id: Uuid) -> Result<Vec<QuestionRun>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .iter()
            .filter(|r| r.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn create_question_run(&self, run: &QuestionRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_run_creates {
            bail!("MemoryStore: create_question_run forced failure");
        }
        inner.runs.push(run.clone());
        Ok(())
    }

    async fn batch(&self, batch_id: Uuid) -> Result<Option<QuestionRunBatch>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.batches.iter().find(|b| b.batch_id == batch_id).cloned())
    }

    async fn batch_created_since(
        &self,
        scope: BatchScope,
        owner_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<QuestionRunBatch>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .batches
            .iter()
            .filter(|b| b.scope == scope && b.owner_id == owner_id && b.created_at >= since)
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn create_batch(&self, batch: &QuestionRunBatch) -> Result<()> {
        self.inner.lock().unwrap().batches.push(batch.clone());
        Ok(())
    }

    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(batch) = inner.batches.iter_mut().find(|b| b.batch_id == batch_id) else {
            return Ok(false);
        };
        if batch.status != from {
            return Ok(false);
        }
        batch.status = to;
        if to == BatchStatus::Running && batch.started_at.is_none() {
            batch.started_at = Some(now);
        }
        batch.updated_at = now;
        Ok(true)
    }

    async fn increment_batch_progress(
        &self,
        batch_id: Uuid,
        completed_delta: i32,
        failed_delta: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let batch = inner
            .batches
            .iter_mut()
            .find(|b| b.batch_id == batch_id)
            .with_context(|| format!("batch {batch_id} not found"))?;
        batch.completed_questions += completed_delta;
        batch.failed_questions += failed_delta;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_batch(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(target) = inner
            .batches
            .iter()
            .find(|b| b.batch_id == batch_id && b.status == BatchStatus::Running)
            .map(|b| (b.scope, b.owner_id))
        else {
            return Ok(false);
        };

        for batch in inner.batches.iter_mut() {
            if batch.batch_id == batch_id {
                batch.status = BatchStatus::Completed;
                batch.completed_questions = completed;
                batch.failed_questions = failed;
                batch.completed_at = Some(now);
                batch.updated_at = now;
                batch.is_latest = true;
            } else if (batch.scope, batch.owner_id) == target {
                batch.is_latest = false;
            }
        }
        Ok(true)
    }

    async fn billing_account(&self, org_id: Uuid) -> Result<Option<BillingAccount>> {
        Ok(self.inner.lock().unwrap().accounts.get(&org_id).cloned())
    }

    async fn balance(&self, payer: Payer) -> Result<f64> {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(&payer)
            .copied()
            .with_context(|| format!("no balance found for payer {payer}"))
    }

    async fn ledger_entry_exists(&self, org_id: Uuid, question_run_id: Uuid) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ledger
            .iter()
            .any(|e| e.org_id == org_id && e.question_run_id == question_run_id))
    }

    async fn record_charge(&self, entry: &UsageLedgerEntry) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let charged = inner
            .ledger
            .iter()
            .any(|e| e.org_id == entry.org_id && e.question_run_id == entry.question_run_id);
        if charged {
            return Ok(false);
        }
        let Some(balance) = inner.balances.get_mut(&entry.payer) else {
            bail!("payer {} not found while charging run {}", entry.payer, entry.question_run_id);
        };
        *balance += entry.amount;
        inner.ledger.push(entry.clone());
        Ok(true)
    }

    async fn ledger_entries_for(&self, org_id: Uuid) -> Result<Vec<UsageLedgerEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrgDirectory for MemoryStore {
    async fn org_details(&self, org_id: Uuid) -> Result<Option<OrgDetails>> {
        Ok(self.inner.lock().unwrap().orgs.get(&org_id).cloned())
    }

    async fn network_details(&self, network_id: Uuid) -> Result<Option<NetworkDetails>> {
        Ok(self.inner.lock().unwrap().networks.get(&network_id).cloned())
    }

    async fn active_org_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.inner.lock().unwrap().orgs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn active_network_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.inner.lock().unwrap().networks.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id_pair() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn second_eval_for_pair_is_rejected() {
        let store = MemoryStore::new();
        let (run, org) = run_id_pair();

        assert!(store.create_org_eval(&OrgEval::minimal(run, org)).await.unwrap());
        assert!(!store.create_org_eval(&OrgEval::minimal(run, org)).await.unwrap());
        assert_eq!(store.evals().len(), 1);
        assert!(store.extraction_presence(run, org).await.unwrap().eval);
    }

    #[tokio::test]
    async fn complete_batch_moves_latest_flag() {
        let owner = Uuid::new_v4();
        let now = Utc::now();
        let mut old = QuestionRunBatch::pending(BatchScope::Org, owner, 3, now);
        old.status = BatchStatus::Completed;
        let new = QuestionRunBatch::pending(BatchScope::Org, owner, 3, now);
        let new_id = new.batch_id;
        let store = MemoryStore::new().with_batch(old).with_batch(new);

        assert!(store
            .transition_batch(new_id, BatchStatus::Pending, BatchStatus::Running, now)
            .await
            .unwrap());
        assert!(store.complete_batch(new_id, 3, 0, now).await.unwrap());

        let batches = store.batches();
        let latest: Vec<_> = batches.iter().filter(|b| b.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].batch_id, new_id);
    }

    #[tokio::test]
    async fn charge_is_recorded_once_and_debits_payer() {
        let org = Uuid::new_v4();
        let run = Uuid::new_v4();
        let payer = Payer::org(org);
        let store = MemoryStore::new().with_balance(payer, 1.0);
        let entry = UsageLedgerEntry {
            entry_id: Uuid::new_v4(),
            org_id: org,
            question_run_id: run,
            scope: BatchScope::Org,
            batch_id: None,
            amount: -0.1,
            payer,
            charged_at: Utc::now(),
        };

        assert!(store.record_charge(&entry).await.unwrap());
        assert!(!store.record_charge(&entry).await.unwrap());
        assert_eq!(store.ledger().len(), 1);
        assert!((store.balance_of(payer).unwrap() - 0.9).abs() < 1e-9);
    }
}
