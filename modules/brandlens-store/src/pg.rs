//! Postgres-backed [`EvalStore`] and [`OrgDirectory`].
//!
//! Uniqueness constraints back every "at most one" rule, so each insert is
//! `ON CONFLICT DO NOTHING` and reports whether it actually wrote.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use brandlens_common::{
    BatchScope, BatchStatus, BillingAccount, Citation, Competitor, Location, ModelTarget,
    NetworkDetails, OrgDetails, OrgEval, Payer, PayerKind, Question, QuestionRun,
    QuestionRunBatch, UsageLedgerEntry,
};

use crate::traits::{EvalStore, ExtractionPresence, OrgDirectory};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn models_for(&self, owner_id: Uuid) -> Result<Vec<ModelTarget>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT m.model_id, m.name
            FROM owner_models om
            JOIN models m ON m.model_id = om.model_id
            WHERE om.owner_id = $1
            ORDER BY m.name
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(model_id, name)| ModelTarget { model_id, name })
            .collect())
    }

    async fn locations_for(&self, owner_id: Uuid) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT l.location_id, l.label
            FROM owner_locations ol
            JOIN locations l ON l.location_id = ol.location_id
            WHERE ol.owner_id = $1
            ORDER BY l.label
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(location_id, label)| Location { location_id, label })
            .collect())
    }

    async fn questions_for(&self, owner_id: Uuid) -> Result<Vec<Question>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT question_id, text
            FROM questions
            WHERE owner_id = $1 AND active
            ORDER BY position, question_id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(question_id, text)| Question { question_id, text })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Row mappings
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct OrgEvalRow {
    eval_id: Uuid,
    question_run_id: Uuid,
    org_id: Uuid,
    mentioned: bool,
    citation: bool,
    mention_text: Option<String>,
    sentiment: Option<String>,
    share_of_voice: f64,
    input_tokens: i32,
    output_tokens: i32,
    total_cost: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrgEvalRow> for OrgEval {
    type Error = anyhow::Error;

    fn try_from(r: OrgEvalRow) -> Result<Self> {
        Ok(OrgEval {
            eval_id: r.eval_id,
            question_run_id: r.question_run_id,
            org_id: r.org_id,
            mentioned: r.mentioned,
            citation: r.citation,
            mention_text: r.mention_text,
            sentiment: r.sentiment.as_deref().map(str::parse).transpose()?,
            share_of_voice: r.share_of_voice,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
            total_cost: r.total_cost,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CompetitorRow {
    competitor_id: Uuid,
    question_run_id: Uuid,
    org_id: Uuid,
    name: String,
    input_tokens: i32,
    output_tokens: i32,
    total_cost: f64,
    created_at: DateTime<Utc>,
}

impl From<CompetitorRow> for Competitor {
    fn from(r: CompetitorRow) -> Self {
        Competitor {
            competitor_id: r.competitor_id,
            question_run_id: r.question_run_id,
            org_id: r.org_id,
            name: r.name,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
            total_cost: r.total_cost,
            created_at: r.created_at,
        }
    }
}

#[derive(FromRow)]
struct CitationRow {
    citation_id: Uuid,
    question_run_id: Uuid,
    org_id: Uuid,
    url: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CitationRow> for Citation {
    type Error = anyhow::Error;

    fn try_from(r: CitationRow) -> Result<Self> {
        Ok(Citation {
            citation_id: r.citation_id,
            question_run_id: r.question_run_id,
            org_id: r.org_id,
            url: r.url,
            kind: r.kind.parse()?,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct QuestionRunRow {
    question_run_id: Uuid,
    question_id: Uuid,
    batch_id: Option<Uuid>,
    model: String,
    location_id: Option<Uuid>,
    location: Option<String>,
    response_text: Option<String>,
    input_tokens: i32,
    output_tokens: i32,
    total_cost: f64,
    created_at: DateTime<Utc>,
}

impl From<QuestionRunRow> for QuestionRun {
    fn from(r: QuestionRunRow) -> Self {
        QuestionRun {
            question_run_id: r.question_run_id,
            question_id: r.question_id,
            batch_id: r.batch_id,
            model: r.model,
            location_id: r.location_id,
            location: r.location,
            response_text: r.response_text,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
            total_cost: r.total_cost,
            created_at: r.created_at,
        }
    }
}

const RUN_COLUMNS: &str = "question_run_id, question_id, batch_id, model, location_id, location, \
     response_text, input_tokens, output_tokens, total_cost, created_at";

#[derive(FromRow)]
struct BatchRow {
    batch_id: Uuid,
    scope: String,
    owner_id: Uuid,
    status: String,
    total_questions: i32,
    completed_questions: i32,
    failed_questions: i32,
    is_latest: bool,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for QuestionRunBatch {
    type Error = anyhow::Error;

    fn try_from(r: BatchRow) -> Result<Self> {
        Ok(QuestionRunBatch {
            batch_id: r.batch_id,
            scope: r.scope.parse()?,
            owner_id: r.owner_id,
            status: r.status.parse()?,
            total_questions: r.total_questions,
            completed_questions: r.completed_questions,
            failed_questions: r.failed_questions,
            is_latest: r.is_latest,
            started_at: r.started_at,
            completed_at: r.completed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

const BATCH_COLUMNS: &str = "batch_id, scope, owner_id, status, total_questions, \
     completed_questions, failed_questions, is_latest, started_at, completed_at, created_at, updated_at";

#[derive(FromRow)]
struct LedgerRow {
    entry_id: Uuid,
    org_id: Uuid,
    question_run_id: Uuid,
    scope: String,
    batch_id: Option<Uuid>,
    amount: f64,
    payer_type: String,
    payer_id: Uuid,
    charged_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for UsageLedgerEntry {
    type Error = anyhow::Error;

    fn try_from(r: LedgerRow) -> Result<Self> {
        Ok(UsageLedgerEntry {
            entry_id: r.entry_id,
            org_id: r.org_id,
            question_run_id: r.question_run_id,
            scope: r.scope.parse()?,
            batch_id: r.batch_id,
            amount: r.amount,
            payer: Payer {
                kind: r.payer_type.parse()?,
                id: r.payer_id,
            },
            charged_at: r.charged_at,
        })
    }
}

fn balance_table(kind: PayerKind) -> (&'static str, &'static str) {
    match kind {
        PayerKind::Org => ("orgs", "org_id"),
        PayerKind::Partner => ("partners", "partner_id"),
    }
}

// ---------------------------------------------------------------------------
// EvalStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EvalStore for PgStore {
    async fn extraction_presence(
        &self,
        question_run_id: Uuid,
        org_id: Uuid,
    ) -> Result<ExtractionPresence> {
        let (eval, competitors, citations) = sqlx::query_as::<_, (bool, bool, bool)>(
            r#"
            SELECT
                EXISTS (SELECT 1 FROM org_evals   WHERE question_run_id = $1 AND org_id = $2),
                EXISTS (SELECT 1 FROM competitors WHERE question_run_id = $1 AND org_id = $2),
                EXISTS (SELECT 1 FROM citations   WHERE question_run_id = $1 AND org_id = $2)
            "#,
        )
        .bind(question_run_id)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ExtractionPresence {
            eval,
            competitors,
            citations,
        })
    }

    async fn org_evals_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<OrgEval>> {
        let rows = sqlx::query_as::<_, OrgEvalRow>(
            r#"
            SELECT eval_id, question_run_id, org_id, mentioned, citation, mention_text,
                   sentiment, share_of_voice, input_tokens, output_tokens, total_cost,
                   created_at, updated_at
            FROM org_evals
            WHERE question_run_id = $1 AND org_id = $2
            "#,
        )
        .bind(question_run_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OrgEval::try_from).collect()
    }

    async fn create_org_eval(&self, eval: &OrgEval) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO org_evals (eval_id, question_run_id, org_id, mentioned, citation,
                                   mention_text, sentiment, share_of_voice, input_tokens,
                                   output_tokens, total_cost, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (question_run_id, org_id) DO NOTHING
            "#,
        )
        .bind(eval.eval_id)
        .bind(eval.question_run_id)
        .bind(eval.org_id)
        .bind(eval.mentioned)
        .bind(eval.citation)
        .bind(&eval.mention_text)
        .bind(eval.sentiment.map(|s| s.as_str()))
        .bind(eval.share_of_voice)
        .bind(eval.input_tokens)
        .bind(eval.output_tokens)
        .bind(eval.total_cost)
        .bind(eval.created_at)
        .bind(eval.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn competitors_for(
        &self,
        question_run_id: Uuid,
        org_id: Uuid,
    ) -> Result<Vec<Competitor>> {
        let rows = sqlx::query_as::<_, CompetitorRow>(
            r#"
            SELECT competitor_id, question_run_id, org_id, name, input_tokens, output_tokens,
                   total_cost, created_at
            FROM competitors
            WHERE question_run_id = $1 AND org_id = $2
            ORDER BY created_at, name
            "#,
        )
        .bind(question_run_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Competitor::from).collect())
    }

    async fn create_competitors(&self, competitors: &[Competitor]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for c in competitors {
            let result = sqlx::query(
                r#"
                INSERT INTO competitors (competitor_id, question_run_id, org_id, name,
                                         input_tokens, output_tokens, total_cost, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (question_run_id, org_id, name) DO NOTHING
                "#,
            )
            .bind(c.competitor_id)
            .bind(c.question_run_id)
            .bind(c.org_id)
            .bind(&c.name)
            .bind(c.input_tokens)
            .bind(c.output_tokens)
            .bind(c.total_cost)
            .bind(c.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert competitor {:?}", c.name))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn citations_for(&self, question_run_id: Uuid, org_id: Uuid) -> Result<Vec<Citation>> {
        let rows = sqlx::query_as::<_, CitationRow>(
            r#"
            SELECT citation_id, question_run_id, org_id, url, kind, created_at
            FROM citations
            WHERE question_run_id = $1 AND org_id = $2
            ORDER BY created_at, url
            "#,
        )
        .bind(question_run_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Citation::try_from).collect()
    }

    async fn create_citations(&self, citations: &[Citation]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for c in citations {
            let result = sqlx::query(
                r#"
                INSERT INTO citations (citation_id, question_run_id, org_id, url, kind, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (question_run_id, org_id, url) DO NOTHING
                "#,
            )
            .bind(c.citation_id)
            .bind(c.question_run_id)
            .bind(c.org_id)
            .bind(&c.url)
            .bind(c.kind.as_str())
            .bind(c.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert citation {}", c.url))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_extractions(&self, question_run_id: Uuid, org_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for table in ["org_evals", "competitors", "citations"] {
            let sql = format!("DELETE FROM {table} WHERE question_run_id = $1 AND org_id = $2");
            deleted += sqlx::query(&sql)
                .bind(question_run_id)
                .bind(org_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn question_runs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<QuestionRun>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {RUN_COLUMNS} FROM question_runs WHERE question_run_id = ANY($1)");
        let rows = sqlx::query_as::<_, QuestionRunRow>(&sql)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(QuestionRun::from).collect())
    }

    async fn question_runs_for_batch(&self, batch_id: Uuid) -> Result<Vec<QuestionRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM question_runs WHERE batch_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, QuestionRunRow>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(QuestionRun::from).collect())
    }

    async fn create_question_run(&self, run: &QuestionRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO question_runs (question_run_id, question_id, batch_id, model, location_id,
                                       location, response_text, input_tokens, output_tokens,
                                       total_cost, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.question_run_id)
        .bind(run.question_id)
        .bind(run.batch_id)
        .bind(&run.model)
        .bind(run.location_id)
        .bind(&run.location)
        .bind(&run.response_text)
        .bind(run.input_tokens)
        .bind(run.output_tokens)
        .bind(run.total_cost)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn batch(&self, batch_id: Uuid) -> Result<Option<QuestionRunBatch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM question_run_batches WHERE batch_id = $1");
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QuestionRunBatch::try_from).transpose()
    }

    async fn batch_created_since(
        &self,
        scope: BatchScope,
        owner_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<QuestionRunBatch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM question_run_batches \
             WHERE scope = $1 AND owner_id = $2 AND created_at >= $3 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, BatchRow>(&sql)
            .bind(scope.as_str())
            .bind(owner_id)
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QuestionRunBatch::try_from).transpose()
    }

    async fn create_batch(&self, batch: &QuestionRunBatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO question_run_batches (batch_id, scope, owner_id, status, total_questions,
                                              completed_questions, failed_questions, is_latest,
                                              started_at, completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.scope.as_str())
        .bind(batch.owner_id)
        .bind(batch.status.as_str())
        .bind(batch.total_questions)
        .bind(batch.completed_questions)
        .bind(batch.failed_questions)
        .bind(batch.is_latest)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition_batch(
        &self,
        batch_id: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE question_run_batches
            SET status = $3::text,
                started_at = CASE WHEN $3::text = 'running' THEN COALESCE(started_at, $4) ELSE started_at END,
                updated_at = $4
            WHERE batch_id = $1 AND status = $2
            "#,
        )
        .bind(batch_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_batch_progress(
        &self,
        batch_id: Uuid,
        completed_delta: i32,
        failed_delta: i32,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE question_run_batches
            SET completed_questions = completed_questions + $2,
                failed_questions = failed_questions + $3,
                updated_at = now()
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(completed_delta)
        .bind(failed_delta)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("batch {batch_id} not found");
        }
        Ok(())
    }

    async fn complete_batch(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let owner = sqlx::query_as::<_, (String, Uuid)>(
            r#"
            UPDATE question_run_batches
            SET status = 'completed',
                completed_questions = $2,
                failed_questions = $3,
                completed_at = $4,
                updated_at = $4,
                is_latest = TRUE
            WHERE batch_id = $1 AND status = 'running'
            RETURNING scope, owner_id
            "#,
        )
        .bind(batch_id)
        .bind(completed)
        .bind(failed)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((scope, owner_id)) = owner else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE question_run_batches
            SET is_latest = FALSE, updated_at = $4
            WHERE scope = $1 AND owner_id = $2 AND batch_id <> $3 AND is_latest
            "#,
        )
        .bind(scope)
        .bind(owner_id)
        .bind(batch_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn billing_account(&self, org_id: Uuid) -> Result<Option<BillingAccount>> {
        let row = sqlx::query_as::<_, (Uuid, Option<Uuid>, bool, Option<f64>)>(
            r#"
            SELECT o.org_id, o.partner_id, o.is_free_tier, p.run_price
            FROM orgs o
            LEFT JOIN partners p ON p.partner_id = o.partner_id
            WHERE o.org_id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(org_id, partner_id, is_free_tier, partner_run_price)| BillingAccount {
                org_id,
                partner_id,
                is_free_tier,
                partner_run_price,
            },
        ))
    }

    async fn balance(&self, payer: Payer) -> Result<f64> {
        let (table, key) = balance_table(payer.kind);
        let sql = format!("SELECT credit_balance FROM {table} WHERE {key} = $1");
        let balance = sqlx::query_scalar::<_, f64>(&sql)
            .bind(payer.id)
            .fetch_optional(&self.pool)
            .await?;

        balance.with_context(|| format!("no balance found for payer {payer}"))
    }

    async fn ledger_entry_exists(&self, org_id: Uuid, question_run_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM usage_ledger WHERE org_id = $1 AND question_run_id = $2)",
        )
        .bind(org_id)
        .bind(question_run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_charge(&self, entry: &UsageLedgerEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO usage_ledger (entry_id, org_id, question_run_id, scope, batch_id, amount,
                                      payer_type, payer_id, charged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (org_id, question_run_id) DO NOTHING
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.org_id)
        .bind(entry.question_run_id)
        .bind(entry.scope.as_str())
        .bind(entry.batch_id)
        .bind(entry.amount)
        .bind(entry.payer.kind.as_str())
        .bind(entry.payer.id)
        .bind(entry.charged_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let (table, key) = balance_table(entry.payer.kind);
        let sql = format!(
            "UPDATE {table} SET credit_balance = credit_balance + $1 WHERE {key} = $2"
        );
        let updated = sqlx::query(&sql)
            .bind(entry.amount)
            .bind(entry.payer.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            bail!("payer {} not found while charging run {}", entry.payer, entry.question_run_id);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn ledger_entries_for(&self, org_id: Uuid) -> Result<Vec<UsageLedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT entry_id, org_id, question_run_id, scope, batch_id, amount, payer_type,
                   payer_id, charged_at
            FROM usage_ledger
            WHERE org_id = $1
            ORDER BY charged_at
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UsageLedgerEntry::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// OrgDirectory
// ---------------------------------------------------------------------------

#[async_trait]
impl OrgDirectory for PgStore {
    async fn org_details(&self, org_id: Uuid) -> Result<Option<OrgDetails>> {
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM orgs WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(name) = name else {
            return Ok(None);
        };

        let websites = sqlx::query_scalar::<_, String>(
            "SELECT url FROM org_websites WHERE org_id = $1 ORDER BY position, url",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(OrgDetails {
            org_id,
            name,
            websites,
            models: self.models_for(org_id).await?,
            locations: self.locations_for(org_id).await?,
            questions: self.questions_for(org_id).await?,
        }))
    }

    async fn network_details(&self, network_id: Uuid) -> Result<Option<NetworkDetails>> {
        let name =
            sqlx::query_scalar::<_, String>("SELECT name FROM networks WHERE network_id = $1")
                .bind(network_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(name) = name else {
            return Ok(None);
        };

        let member_org_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT org_id FROM network_members WHERE network_id = $1 ORDER BY org_id",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(NetworkDetails {
            network_id,
            name,
            member_org_ids,
            models: self.models_for(network_id).await?,
            locations: self.locations_for(network_id).await?,
            questions: self.questions_for(network_id).await?,
        }))
    }

    async fn active_org_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT org_id FROM orgs WHERE active ORDER BY org_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn active_network_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT network_id FROM networks WHERE active ORDER BY network_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
