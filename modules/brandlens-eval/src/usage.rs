//! Per-run billing. One ledger entry per (org, question run), ever.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use brandlens_common::{BatchScope, Payer, QuestionRun, UsageLedgerEntry};
use brandlens_store::EvalStore;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("insufficient credits for {payer}: balance {balance:.2}, required {required:.2}")]
    InsufficientCredits {
        payer: Payer,
        balance: f64,
        required: f64,
    },

    #[error("billing account for org {0} not found")]
    OrgNotFound(Uuid),

    #[error("org {0} has no partner to bill")]
    NoPartner(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Passed pre-flight check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceCheck {
    pub payer: Payer,
    pub unit_price: f64,
    pub balance: f64,
    pub required: f64,
}

pub struct UsageLedger {
    store: Arc<dyn EvalStore>,
    default_run_price: f64,
    placeholder: String,
}

impl UsageLedger {
    pub fn new(
        store: Arc<dyn EvalStore>,
        default_run_price: f64,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            default_run_price,
            placeholder: placeholder.into(),
        }
    }

    /// Who pays for the org's runs in this scope, and how much per run.
    ///
    /// Paid orgs pay for their own org-scope runs. Free-tier orgs and every
    /// network-scope run are billed to the partner.
    pub async fn pricing(&self, org_id: Uuid, scope: BatchScope) -> Result<(Payer, f64), UsageError> {
        let account = self
            .store
            .billing_account(org_id)
            .await?
            .ok_or(UsageError::OrgNotFound(org_id))?;

        let unit_price = account.partner_run_price.unwrap_or(self.default_run_price);
        let payer = if scope == BatchScope::Org && !account.is_free_tier {
            Payer::org(org_id)
        } else {
            Payer::partner(account.partner_id.ok_or(UsageError::NoPartner(org_id))?)
        };
        Ok((payer, unit_price))
    }

    /// Reject the whole batch up front when the payer cannot cover it.
    pub async fn check_balance(
        &self,
        org_id: Uuid,
        estimated_runs: u32,
        scope: BatchScope,
    ) -> Result<BalanceCheck, UsageError> {
        let (payer, unit_price) = self.pricing(org_id, scope).await?;
        let balance = self.store.balance(payer).await?;
        let required = unit_price * f64::from(estimated_runs);

        if balance < required {
            warn!(org = %org_id, %payer, balance, required, "Insufficient credits");
            return Err(UsageError::InsufficientCredits {
                payer,
                balance,
                required,
            });
        }

        debug!(org = %org_id, %payer, balance, required, "Balance check passed");
        Ok(BalanceCheck {
            payer,
            unit_price,
            balance,
            required,
        })
    }

    /// Balance check for several orgs charged for the same runs, e.g. every
    /// member of a network. Orgs sharing a payer are summed before checking.
    pub async fn check_balance_many(
        &self,
        org_ids: &[Uuid],
        estimated_runs: u32,
        scope: BatchScope,
    ) -> Result<Vec<BalanceCheck>, UsageError> {
        let mut required: Vec<(Payer, f64, f64)> = Vec::new();
        for &org_id in org_ids {
            let (payer, unit_price) = self.pricing(org_id, scope).await?;
            let cost = unit_price * f64::from(estimated_runs);
            match required.iter_mut().find(|(p, _, _)| *p == payer) {
                Some(entry) => entry.2 += cost,
                None => required.push((payer, unit_price, cost)),
            }
        }

        let mut checks = Vec::with_capacity(required.len());
        for (payer, unit_price, required) in required {
            let balance = self.store.balance(payer).await?;
            if balance < required {
                warn!(%payer, balance, required, "Insufficient credits");
                return Err(UsageError::InsufficientCredits {
                    payer,
                    balance,
                    required,
                });
            }
            checks.push(BalanceCheck {
                payer,
                unit_price,
                balance,
                required,
            });
        }
        Ok(checks)
    }

    /// Charge every successful run of the batch not yet charged to the org.
    pub async fn track_batch_usage(
        &self,
        org_id: Uuid,
        batch_id: Uuid,
        scope: BatchScope,
    ) -> Result<usize, UsageError> {
        let runs = self.store.question_runs_for_batch(batch_id).await?;
        self.charge(org_id, &runs, scope, Some(batch_id)).await
    }

    /// Charge the given runs for the org. Unknown ids are skipped.
    pub async fn track_individual_runs(
        &self,
        org_id: Uuid,
        question_run_ids: &[Uuid],
        scope: BatchScope,
    ) -> Result<usize, UsageError> {
        let runs = self.store.question_runs_by_ids(question_run_ids).await?;
        if runs.len() < question_run_ids.len() {
            warn!(
                org = %org_id,
                requested = question_run_ids.len(),
                found = runs.len(),
                "Some question runs not found, skipping them"
            );
        }
        self.charge(org_id, &runs, scope, None).await
    }

    async fn charge(
        &self,
        org_id: Uuid,
        runs: &[QuestionRun],
        scope: BatchScope,
        batch_id: Option<Uuid>,
    ) -> Result<usize, UsageError> {
        let billable: Vec<&QuestionRun> = runs
            .iter()
            .filter(|r| r.is_successful(&self.placeholder))
            .collect();
        if billable.is_empty() {
            debug!(org = %org_id, "No billable runs");
            return Ok(0);
        }

        let (payer, unit_price) = self.pricing(org_id, scope).await?;
        let mut charged = 0;
        let mut skipped = 0;

        for run in billable {
            if self
                .store
                .ledger_entry_exists(org_id, run.question_run_id)
                .await?
            {
                skipped += 1;
                continue;
            }

            let entry = UsageLedgerEntry {
                entry_id: Uuid::new_v4(),
                org_id,
                question_run_id: run.question_run_id,
                scope,
                batch_id: batch_id.or(run.batch_id),
                amount: -unit_price,
                payer,
                charged_at: Utc::now(),
            };
            if self.store.record_charge(&entry).await? {
                charged += 1;
            } else {
                skipped += 1;
            }
        }

        info!(org = %org_id, %payer, %scope, charged, skipped, unit_price, "Usage tracked");
        Ok(charged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{org_details, paid_account, question_run};
    use brandlens_common::{BillingAccount, FAILED_PROMPT_PLACEHOLDER};
    use brandlens_store::testing::MemoryStore;

    struct Accounts {
        org: Uuid,
        partner: Uuid,
    }

    fn seeded(account: impl FnOnce(Uuid, Uuid) -> BillingAccount) -> (MemoryStore, Accounts) {
        let ids = Accounts {
            org: Uuid::new_v4(),
            partner: Uuid::new_v4(),
        };
        let store = MemoryStore::new()
            .with_org(org_details(ids.org, "Acme", &[]), account(ids.org, ids.partner))
            .with_balance(Payer::org(ids.org), 1.0)
            .with_balance(Payer::partner(ids.partner), 5.0);
        (store, ids)
    }

    fn ledger(store: &Arc<MemoryStore>) -> UsageLedger {
        UsageLedger::new(store.clone(), 0.10, FAILED_PROMPT_PLACEHOLDER)
    }

    #[tokio::test]
    async fn charges_each_run_once() {
        let (store, ids) = seeded(paid_account);
        let batch = Uuid::new_v4();
        let store = Arc::new(
            store
                .with_run(question_run(Some(batch), Some("Acme is great")))
                .with_run(question_run(Some(batch), Some("Globex wins")))
                .with_run(question_run(Some(batch), Some(FAILED_PROMPT_PLACEHOLDER)))
                .with_run(question_run(Some(batch), Some("   "))),
        );
        let usage = ledger(&store);

        let first = usage.track_batch_usage(ids.org, batch, BatchScope::Org).await.unwrap();
        let second = usage.track_batch_usage(ids.org, batch, BatchScope::Org).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(store.ledger().len(), 2);
        let balance = store.balance_of(Payer::org(ids.org)).unwrap();
        assert!((balance - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn individual_runs_share_the_idempotency_key() {
        let (store, ids) = seeded(paid_account);
        let run = question_run(None, Some("Acme"));
        let run_id = run.question_run_id;
        let store = Arc::new(store.with_run(run));
        let usage = ledger(&store);

        assert_eq!(
            usage
                .track_individual_runs(ids.org, &[run_id, Uuid::new_v4()], BatchScope::Org)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            usage
                .track_individual_runs(ids.org, &[run_id], BatchScope::Org)
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.ledger_entries_for(ids.org).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn free_tier_and_network_runs_bill_the_partner() {
        let (store, ids) = seeded(|org, partner| BillingAccount {
            is_free_tier: true,
            partner_run_price: Some(0.25),
            ..paid_account(org, partner)
        });
        let usage = ledger(&Arc::new(store));

        assert_eq!(
            usage.pricing(ids.org, BatchScope::Org).await.unwrap(),
            (Payer::partner(ids.partner), 0.25)
        );

        let (store, ids) = seeded(paid_account);
        let usage = ledger(&Arc::new(store));
        assert_eq!(
            usage.pricing(ids.org, BatchScope::Org).await.unwrap(),
            (Payer::org(ids.org), 0.10)
        );
        assert_eq!(
            usage.pricing(ids.org, BatchScope::Network).await.unwrap().0,
            Payer::partner(ids.partner)
        );
    }

    #[tokio::test]
    async fn balance_check_is_a_hard_stop() {
        let (store, ids) = seeded(paid_account);
        let usage = ledger(&Arc::new(store));

        let ok = usage.check_balance(ids.org, 10, BatchScope::Org).await.unwrap();
        assert_eq!(ok.payer, Payer::org(ids.org));
        assert!((ok.required - 1.0).abs() < 1e-9);

        let err = usage
            .check_balance(ids.org, 11, BatchScope::Org)
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn shared_payer_is_checked_against_the_sum() {
        let (store, ids) = seeded(paid_account);
        let sibling = Uuid::new_v4();
        let store = store.with_org(
            org_details(sibling, "Globex", &[]),
            paid_account(sibling, ids.partner),
        );
        let usage = ledger(&Arc::new(store));

        // Partner balance 5.0 covers 2 orgs x 20 runs x 0.10, not 2 x 30.
        let checks = usage
            .check_balance_many(&[ids.org, sibling], 20, BatchScope::Network)
            .await
            .unwrap();
        assert_eq!(checks.len(), 1);
        assert!((checks[0].required - 4.0).abs() < 1e-9);

        assert!(matches!(
            usage
                .check_balance_many(&[ids.org, sibling], 30, BatchScope::Network)
                .await,
            Err(UsageError::InsufficientCredits { .. })
        ));
    }

    #[tokio::test]
    async fn missing_partner_or_org_is_reported() {
        let (store, ids) = seeded(|org, _| BillingAccount {
            org_id: org,
            partner_id: None,
            is_free_tier: true,
            partner_run_price: None,
        });
        let usage = ledger(&Arc::new(store));

        assert!(matches!(
            usage.check_balance(ids.org, 1, BatchScope::Org).await,
            Err(UsageError::NoPartner(_))
        ));
        assert!(matches!(
            usage.check_balance(Uuid::new_v4(), 1, BatchScope::Org).await,
            Err(UsageError::OrgNotFound(_))
        ));
    }
}
