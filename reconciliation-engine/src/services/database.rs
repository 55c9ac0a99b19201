//! Postgres entity store for reconciliation-engine.

use crate::error::{ConflictInvariant, ReconError};
use crate::models::{
    Account, AccountKind, BankTransaction, DateWindow, EntityKind, EntityRef, Invoice,
    MsiCandidate, MsiDiagnostics, MsiStatus, NewAccount, NewBankTransaction, NewInvoice, Open,
    PaymentMethod, ReconciliationSplit, ReconciliationStatus, ReconciliationSummary, SplitGroup,
    SplitKind, StatusTotals,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::store::{EntityStore, LedgerTx};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

// ============================================================================
// Row Mappings
// ============================================================================

#[derive(Debug, FromRow)]
struct AccountRow {
    account_id: Uuid,
    tenant_id: Uuid,
    account_kind: String,
    currency: String,
    created_utc: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(r: AccountRow) -> Self {
        Self {
            account_id: r.account_id,
            tenant_id: r.tenant_id,
            kind: AccountKind::from_str(&r.account_kind),
            currency: r.currency,
            created_utc: r.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    tenant_id: Uuid,
    account_id: Uuid,
    amount: i64,
    currency: String,
    posted_date: NaiveDate,
    description: String,
    running_balance: Option<i64>,
    reconciliation_status: String,
    created_utc: DateTime<Utc>,
}

impl From<TransactionRow> for BankTransaction {
    fn from(r: TransactionRow) -> Self {
        Self {
            transaction_id: r.transaction_id,
            tenant_id: r.tenant_id,
            account_id: r.account_id,
            amount: r.amount,
            currency: r.currency,
            posted_date: r.posted_date,
            description: r.description,
            running_balance: r.running_balance,
            status: ReconciliationStatus::from_str(&r.reconciliation_status),
            created_utc: r.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct OpenTransactionRow {
    #[sqlx(flatten)]
    row: TransactionRow,
    allocated: i64,
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    account_id: Option<Uuid>,
    counterparty_tax_id: String,
    counterparty_name: String,
    total: i64,
    currency: String,
    issue_date: NaiveDate,
    payment_method: String,
    payment_form: Option<String>,
    reconciliation_status: String,
    created_utc: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(r: InvoiceRow) -> Self {
        Self {
            invoice_id: r.invoice_id,
            tenant_id: r.tenant_id,
            account_id: r.account_id,
            counterparty_tax_id: r.counterparty_tax_id,
            counterparty_name: r.counterparty_name,
            total: r.total,
            currency: r.currency,
            issue_date: r.issue_date,
            payment_method: PaymentMethod::from_str(&r.payment_method),
            payment_form: r.payment_form,
            status: ReconciliationStatus::from_str(&r.reconciliation_status),
            created_utc: r.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct OpenInvoiceRow {
    #[sqlx(flatten)]
    row: InvoiceRow,
    allocated: i64,
}

#[derive(Debug, FromRow)]
struct SplitRow {
    split_id: Uuid,
    split_group_id: Uuid,
    tenant_id: Uuid,
    transaction_id: Uuid,
    invoice_id: Uuid,
    allocated_amount: i64,
    split_kind: String,
    created_by: String,
    created_utc: DateTime<Utc>,
    reversed_utc: Option<DateTime<Utc>>,
}

impl From<SplitRow> for ReconciliationSplit {
    fn from(r: SplitRow) -> Self {
        Self {
            split_id: r.split_id,
            split_group_id: r.split_group_id,
            tenant_id: r.tenant_id,
            transaction_id: r.transaction_id,
            invoice_id: r.invoice_id,
            allocated_amount: r.allocated_amount,
            kind: SplitKind::from_str(&r.split_kind),
            created_by: r.created_by,
            created_utc: r.created_utc,
            reversed_utc: r.reversed_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct CandidateRow {
    candidate_id: Uuid,
    tenant_id: Uuid,
    account_id: Uuid,
    transaction_id: Uuid,
    invoice_id: Uuid,
    plan_length: i32,
    per_period_amount: i64,
    remainder: i64,
    confidence: f64,
    source: String,
    runner_up_plan_length: Option<i32>,
    runner_up_relative_error: Option<f64>,
    msi_status: String,
    created_utc: DateTime<Utc>,
}

impl From<CandidateRow> for MsiCandidate {
    fn from(r: CandidateRow) -> Self {
        let diagnostics = match (r.runner_up_plan_length, r.runner_up_relative_error) {
            (Some(n), Some(err)) => Some(MsiDiagnostics {
                runner_up_plan_length: n.max(0) as u32,
                runner_up_relative_error: err,
            }),
            _ => None,
        };
        Self {
            candidate_id: r.candidate_id,
            tenant_id: r.tenant_id,
            account_id: r.account_id,
            transaction_id: r.transaction_id,
            invoice_id: r.invoice_id,
            plan_length: r.plan_length.max(0) as u32,
            per_period_amount: r.per_period_amount,
            remainder: r.remainder,
            confidence: r.confidence,
            source: r.source,
            diagnostics,
            status: MsiStatus::from_str(&r.msi_status),
            created_utc: r.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct StatusRow {
    status: String,
    row_count: i64,
    amount_sum: i64,
    allocated_sum: i64,
}

fn fold_totals(rows: Vec<StatusRow>) -> StatusTotals {
    let mut totals = StatusTotals::default();
    for r in rows {
        match ReconciliationStatus::from_str(&r.status) {
            ReconciliationStatus::Reconciled => {
                totals.reconciled_count += r.row_count;
                totals.reconciled_amount += r.amount_sum;
            }
            ReconciliationStatus::PartiallyReconciled => {
                totals.partially_reconciled_count += r.row_count;
                totals.partially_reconciled_amount += r.amount_sum;
            }
            ReconciliationStatus::Unreconciled => {
                totals.unreconciled_count += r.row_count;
                totals.unreconciled_amount += r.amount_sum;
            }
        }
        totals.allocated_amount += r.allocated_sum;
    }
    totals
}

/// Group split rows (ordered by group) into split groups, keeping row order.
fn group_splits(rows: Vec<SplitRow>) -> Vec<SplitGroup> {
    let mut groups: Vec<Vec<ReconciliationSplit>> = Vec::new();
    for split in rows.into_iter().map(ReconciliationSplit::from) {
        match groups.last_mut() {
            Some(current) if current[0].split_group_id == split.split_group_id => {
                current.push(split);
                continue;
            }
            _ => {}
        }
        groups.push(vec![split]);
    }
    groups
        .into_iter()
        .filter_map(SplitGroup::from_splits)
        .collect()
}

fn table_for(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Account => ("accounts", "account_id"),
        EntityKind::Transaction => ("bank_transactions", "transaction_id"),
        EntityKind::Invoice => ("invoices", "invoice_id"),
        EntityKind::SplitGroup => ("reconciliation_splits", "split_group_id"),
        EntityKind::MsiCandidate => ("msi_candidates", "candidate_id"),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Classify a row that the tenant-scoped query did not return.
    async fn missing(&self, tenant_id: Uuid, kind: EntityKind, id: Uuid) -> ReconError {
        match self.foreign_rows_exist(tenant_id, kind, &[id]).await {
            Ok(true) => ReconError::scope(format!(
                "{} belongs to another tenant",
                EntityRef { kind, id }
            )),
            Ok(false) => ReconError::not_found(kind, id),
            Err(e) => e,
        }
    }

    async fn fetch_account(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Account>, ReconError> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT account_id, tenant_id, account_kind, currency, created_utc
            FROM accounts
            WHERE tenant_id = $1 AND account_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::database("get account", e))?;
        Ok(row.map(Account::from))
    }

    async fn fetch_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<MsiCandidate>, ReconError> {
        let row = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length,
                   per_period_amount, remainder, confidence, source, runner_up_plan_length,
                   runner_up_relative_error, msi_status, created_utc
            FROM msi_candidates
            WHERE tenant_id = $1 AND candidate_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::database("get msi candidate", e))?;
        Ok(row.map(MsiCandidate::from))
    }
}

#[async_trait]
impl EntityStore for PgStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    #[instrument(skip(self, account), fields(tenant_id = %account.tenant_id))]
    async fn insert_account(&self, account: &NewAccount) -> Result<Account, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_account"])
            .start_timer();

        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO accounts (account_id, tenant_id, account_kind, currency)
            VALUES ($1, $2, $3, $4)
            RETURNING account_id, tenant_id, account_kind, currency, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account.tenant_id)
        .bind(account.kind.as_str())
        .bind(&account.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ReconError::database("create account", e))?;

        timer.observe_duration();
        info!(account_id = %row.account_id, "Account created");

        Ok(row.into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id))]
    async fn get_account(&self, tenant_id: Uuid, account_id: Uuid) -> Result<Account, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();
        let account = self.fetch_account(tenant_id, account_id).await?;
        timer.observe_duration();

        match account {
            Some(account) => Ok(account),
            None => Err(self.missing(tenant_id, EntityKind::Account, account_id).await),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id))]
    async fn update_account_kind(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        kind: AccountKind,
    ) -> Result<Account, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_account_kind"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconError::database("begin transaction", e))?;

        let current = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT account_id, tenant_id, account_kind, currency, created_utc
            FROM accounts
            WHERE tenant_id = $1 AND account_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconError::database("lock account", e))?;

        let Some(current) = current else {
            drop(tx);
            return Err(self.missing(tenant_id, EntityKind::Account, account_id).await);
        };
        if AccountKind::from_str(&current.account_kind) == kind {
            return Ok(current.into());
        }

        let in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM bank_transactions WHERE tenant_id = $1 AND account_id = $2
            )
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReconError::database("check account usage", e))?;

        if in_use {
            return Err(ReconError::conflict(
                EntityRef::account(account_id),
                ConflictInvariant::AccountKindLocked,
                "account already has transactions",
            ));
        }

        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            UPDATE accounts SET account_kind = $3
            WHERE tenant_id = $1 AND account_id = $2
            RETURNING account_id, tenant_id, account_kind, currency, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReconError::database("update account kind", e))?;

        tx.commit()
            .await
            .map_err(|e| ReconError::database("commit account kind", e))?;

        timer.observe_duration();
        info!(kind = kind.as_str(), "Account kind updated");

        Ok(row.into())
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    #[instrument(skip(self, transaction), fields(tenant_id = %transaction.tenant_id, account_id = %transaction.account_id))]
    async fn insert_transaction(
        &self,
        transaction: &NewBankTransaction,
    ) -> Result<BankTransaction, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconError::database("begin transaction", e))?;

        // Shares the account row lock with kind updates.
        let currency: Option<String> = sqlx::query_scalar(
            r#"
            SELECT currency FROM accounts
            WHERE tenant_id = $1 AND account_id = $2
            FOR SHARE
            "#,
        )
        .bind(transaction.tenant_id)
        .bind(transaction.account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconError::database("lock account", e))?;

        let Some(currency) = currency else {
            drop(tx);
            return Err(self
                .missing(transaction.tenant_id, EntityKind::Account, transaction.account_id)
                .await);
        };

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO bank_transactions (transaction_id, tenant_id, account_id, amount, currency, posted_date, description, running_balance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING transaction_id, tenant_id, account_id, amount, currency, posted_date, description, running_balance, reconciliation_status, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transaction.tenant_id)
        .bind(transaction.account_id)
        .bind(transaction.amount)
        .bind(&currency)
        .bind(transaction.posted_date)
        .bind(&transaction.description)
        .bind(transaction.running_balance)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReconError::database("create transaction", e))?;

        tx.commit()
            .await
            .map_err(|e| ReconError::database("commit transaction insert", e))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<BankTransaction, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT transaction_id, tenant_id, account_id, amount, currency, posted_date, description, running_balance, reconciliation_status, created_utc
            FROM bank_transactions
            WHERE tenant_id = $1 AND transaction_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::database("get transaction", e))?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self
                .missing(tenant_id, EntityKind::Transaction, transaction_id)
                .await),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn delete_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_transaction"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconError::database("begin transaction", e))?;

        let locked: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT transaction_id FROM bank_transactions
            WHERE tenant_id = $1 AND transaction_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconError::database("lock transaction", e))?;

        if locked.is_none() {
            drop(tx);
            return Err(self
                .missing(tenant_id, EntityKind::Transaction, transaction_id)
                .await);
        }

        let referenced: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM reconciliation_splits WHERE tenant_id = $1 AND transaction_id = $2
            )
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ReconError::database("check split references", e))?;

        if referenced {
            return Err(ReconError::conflict(
                EntityRef::transaction(transaction_id),
                ConflictInvariant::ReferencedBySplit,
                "transaction is referenced by the split ledger",
            ));
        }

        sqlx::query("DELETE FROM bank_transactions WHERE tenant_id = $1 AND transaction_id = $2")
            .bind(tenant_id)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReconError::database("delete transaction", e))?;

        tx.commit()
            .await
            .map_err(|e| ReconError::database("commit transaction delete", e))?;

        timer.observe_duration();
        info!("Transaction deleted");
        Ok(())
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id))]
    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        if let Some(account_id) = invoice.account_id {
            if self.fetch_account(invoice.tenant_id, account_id).await?.is_none() {
                return Err(self
                    .missing(invoice.tenant_id, EntityKind::Account, account_id)
                    .await);
            }
        }

        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, account_id, counterparty_tax_id, counterparty_name, total, currency, issue_date, payment_method, payment_form)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING invoice_id, tenant_id, account_id, counterparty_tax_id, counterparty_name, total, currency, issue_date, payment_method, payment_form, reconciliation_status, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice.tenant_id)
        .bind(invoice.account_id)
        .bind(&invoice.counterparty_tax_id)
        .bind(&invoice.counterparty_name)
        .bind(invoice.total)
        .bind(&invoice.currency)
        .bind(invoice.issue_date)
        .bind(invoice.payment_method.as_str())
        .bind(&invoice.payment_form)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ReconError::database("create invoice", e))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT invoice_id, tenant_id, account_id, counterparty_tax_id, counterparty_name, total, currency, issue_date, payment_method, payment_form, reconciliation_status, created_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::database("get invoice", e))?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.missing(tenant_id, EntityKind::Invoice, invoice_id).await),
        }
    }

    // =========================================================================
    // Open Rows
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn open_transactions(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
        account_id: Option<Uuid>,
    ) -> Result<Vec<Open<BankTransaction>>, ReconError> {
        window.validate()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, OpenTransactionRow>(
            r#"
            SELECT t.transaction_id, t.tenant_id, t.account_id, t.amount, t.currency, t.posted_date,
                   t.description, t.running_balance, t.reconciliation_status, t.created_utc,
                   COALESCE((
                       SELECT SUM(s.allocated_amount) FROM reconciliation_splits s
                       WHERE s.tenant_id = t.tenant_id
                         AND s.transaction_id = t.transaction_id
                         AND s.reversed_utc IS NULL
                   ), 0)::BIGINT AS allocated
            FROM bank_transactions t
            WHERE t.tenant_id = $1
              AND t.posted_date BETWEEN $2 AND $3
              AND ($4::UUID IS NULL OR t.account_id = $4)
              AND t.reconciliation_status <> 'reconciled'
            ORDER BY t.posted_date, t.transaction_id
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("list open transactions", e))?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|r| Open {
                item: r.row.into(),
                allocated: r.allocated,
            })
            .collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn open_invoices(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Open<Invoice>>, ReconError> {
        window.validate()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_invoices"])
            .start_timer();

        let rows = sqlx::query_as::<_, OpenInvoiceRow>(
            r#"
            SELECT i.invoice_id, i.tenant_id, i.account_id, i.counterparty_tax_id, i.counterparty_name,
                   i.total, i.currency, i.issue_date, i.payment_method, i.payment_form,
                   i.reconciliation_status, i.created_utc,
                   COALESCE((
                       SELECT SUM(s.allocated_amount) FROM reconciliation_splits s
                       WHERE s.tenant_id = i.tenant_id
                         AND s.invoice_id = i.invoice_id
                         AND s.reversed_utc IS NULL
                   ), 0)::BIGINT AS allocated
            FROM invoices i
            WHERE i.tenant_id = $1
              AND i.issue_date BETWEEN $2 AND $3
              AND i.reconciliation_status <> 'reconciled'
            ORDER BY i.issue_date, i.invoice_id
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("list open invoices", e))?;

        timer.observe_duration();

        Ok(rows
            .into_iter()
            .map(|r| Open {
                item: r.row.into(),
                allocated: r.allocated,
            })
            .collect())
    }

    // =========================================================================
    // Split Ledger
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id, split_group_id = %split_group_id))]
    async fn get_split_group(
        &self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_split_group"])
            .start_timer();

        let rows = sqlx::query_as::<_, SplitRow>(
            r#"
            SELECT split_id, split_group_id, tenant_id, transaction_id, invoice_id, allocated_amount, split_kind, created_by, created_utc, reversed_utc
            FROM reconciliation_splits
            WHERE tenant_id = $1 AND split_group_id = $2
            ORDER BY split_id
            "#,
        )
        .bind(tenant_id)
        .bind(split_group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("get split group", e))?;

        timer.observe_duration();

        match group_splits(rows).into_iter().next() {
            Some(group) => Ok(group),
            None => Err(self
                .missing(tenant_id, EntityKind::SplitGroup, split_group_id)
                .await),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_split_groups(
        &self,
        tenant_id: Uuid,
        include_reversed: bool,
    ) -> Result<Vec<SplitGroup>, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_split_groups"])
            .start_timer();

        let rows = sqlx::query_as::<_, SplitRow>(
            r#"
            SELECT s.split_id, s.split_group_id, s.tenant_id, s.transaction_id, s.invoice_id, s.allocated_amount,
                   s.split_kind, s.created_by, s.created_utc, s.reversed_utc
            FROM reconciliation_splits s
            JOIN (
                SELECT split_group_id, MIN(created_utc) AS group_created
                FROM reconciliation_splits
                WHERE tenant_id = $1
                GROUP BY split_group_id
                HAVING $2 OR BOOL_AND(reversed_utc IS NULL)
            ) g ON g.split_group_id = s.split_group_id
            WHERE s.tenant_id = $1
            ORDER BY g.group_created, s.split_group_id, s.split_id
            "#,
        )
        .bind(tenant_id)
        .bind(include_reversed)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("list split groups", e))?;

        timer.observe_duration();
        Ok(group_splits(rows))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn summary(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<ReconciliationSummary, ReconError> {
        window.validate()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["summary"])
            .start_timer();

        let transactions = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT t.reconciliation_status AS status,
                   COUNT(*)::BIGINT AS row_count,
                   COALESCE(SUM(ABS(t.amount)), 0)::BIGINT AS amount_sum,
                   COALESCE(SUM(a.allocated), 0)::BIGINT AS allocated_sum
            FROM bank_transactions t
            LEFT JOIN (
                SELECT transaction_id, SUM(allocated_amount) AS allocated
                FROM reconciliation_splits
                WHERE tenant_id = $1 AND reversed_utc IS NULL
                GROUP BY transaction_id
            ) a ON a.transaction_id = t.transaction_id
            WHERE t.tenant_id = $1 AND t.posted_date BETWEEN $2 AND $3
            GROUP BY t.reconciliation_status
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("summarize transactions", e))?;

        let invoices = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT i.reconciliation_status AS status,
                   COUNT(*)::BIGINT AS row_count,
                   COALESCE(SUM(i.total), 0)::BIGINT AS amount_sum,
                   COALESCE(SUM(a.allocated), 0)::BIGINT AS allocated_sum
            FROM invoices i
            LEFT JOIN (
                SELECT invoice_id, SUM(allocated_amount) AS allocated
                FROM reconciliation_splits
                WHERE tenant_id = $1 AND reversed_utc IS NULL
                GROUP BY invoice_id
            ) a ON a.invoice_id = i.invoice_id
            WHERE i.tenant_id = $1 AND i.issue_date BETWEEN $2 AND $3
            GROUP BY i.reconciliation_status
            "#,
        )
        .bind(tenant_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("summarize invoices", e))?;

        timer.observe_duration();

        Ok(ReconciliationSummary {
            tenant_id,
            window,
            transactions: fold_totals(transactions),
            invoices: fold_totals(invoices),
        })
    }

    // =========================================================================
    // Installment Candidates
    // =========================================================================

    #[instrument(skip(self, candidates), fields(count = candidates.len()))]
    async fn save_msi_candidates(
        &self,
        candidates: &[MsiCandidate],
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_msi_candidates"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconError::database("begin transaction", e))?;

        let mut saved = Vec::new();
        for c in candidates {
            let row = sqlx::query_as::<_, CandidateRow>(
                r#"
                INSERT INTO msi_candidates (candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length, per_period_amount, remainder, confidence, source, runner_up_plan_length, runner_up_relative_error, msi_status, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (tenant_id, transaction_id, invoice_id) WHERE msi_status = 'pending' DO NOTHING
                RETURNING candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length, per_period_amount, remainder, confidence, source, runner_up_plan_length, runner_up_relative_error, msi_status, created_utc
                "#,
            )
            .bind(c.candidate_id)
            .bind(c.tenant_id)
            .bind(c.account_id)
            .bind(c.transaction_id)
            .bind(c.invoice_id)
            .bind(c.plan_length as i32)
            .bind(c.per_period_amount)
            .bind(c.remainder)
            .bind(c.confidence)
            .bind(&c.source)
            .bind(c.diagnostics.map(|d| d.runner_up_plan_length as i32))
            .bind(c.diagnostics.map(|d| d.runner_up_relative_error))
            .bind(c.status.as_str())
            .bind(c.created_utc)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ReconError::database("save msi candidate", e))?;

            if let Some(row) = row {
                saved.push(row.into());
            }
        }

        tx.commit()
            .await
            .map_err(|e| ReconError::database("commit msi candidates", e))?;

        timer.observe_duration();
        Ok(saved)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_msi_candidates(
        &self,
        tenant_id: Uuid,
        status: Option<MsiStatus>,
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_msi_candidates"])
            .start_timer();

        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length,
                   per_period_amount, remainder, confidence, source, runner_up_plan_length,
                   runner_up_relative_error, msi_status, created_utc
            FROM msi_candidates
            WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR msi_status = $2)
            ORDER BY confidence DESC, candidate_id
            "#,
        )
        .bind(tenant_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::database("list msi candidates", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(MsiCandidate::from).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    async fn get_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_msi_candidate"])
            .start_timer();
        let candidate = self.fetch_candidate(tenant_id, candidate_id).await?;
        timer.observe_duration();

        match candidate {
            Some(candidate) => Ok(candidate),
            None => Err(self
                .missing(tenant_id, EntityKind::MsiCandidate, candidate_id)
                .await),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    async fn discard_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["discard_msi_candidate"])
            .start_timer();

        let row = sqlx::query_as::<_, CandidateRow>(
            r#"
            UPDATE msi_candidates SET msi_status = 'discarded'
            WHERE tenant_id = $1 AND candidate_id = $2 AND msi_status = 'pending'
            RETURNING candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length,
                      per_period_amount, remainder, confidence, source, runner_up_plan_length,
                      runner_up_relative_error, msi_status, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::database("discard msi candidate", e))?;

        timer.observe_duration();

        if let Some(row) = row {
            info!("Installment candidate discarded");
            return Ok(row.into());
        }
        match self.fetch_candidate(tenant_id, candidate_id).await? {
            Some(_) => Err(ReconError::conflict(
                EntityRef::msi_candidate(candidate_id),
                ConflictInvariant::CandidateNotPending,
                "candidate already resolved",
            )),
            None => Err(self
                .missing(tenant_id, EntityKind::MsiCandidate, candidate_id)
                .await),
        }
    }

    async fn foreign_rows_exist(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<bool, ReconError> {
        if ids.is_empty() {
            return Ok(false);
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["foreign_rows_exist"])
            .start_timer();

        let (table, column) = table_for(kind);
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ANY($1) AND tenant_id <> $2)",
            table, column
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(ids)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ReconError::database("probe foreign rows", e))?;

        timer.observe_duration();
        Ok(exists)
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, ReconError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconError::database("begin transaction", e))?;
        Ok(Box::new(PgLedgerTx { tx: Some(tx) }))
    }
}

// ============================================================================
// Unit of Work
// ============================================================================

/// Postgres transaction. Dropping it before `commit` rolls back.
pub struct PgLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerTx {
    fn conn(&mut self) -> Result<&mut PgConnection, ReconError> {
        self.tx.as_deref_mut().ok_or_else(|| {
            ReconError::Storage(AppError::InternalError(anyhow::anyhow!(
                "unit of work already committed"
            )))
        })
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<BankTransaction>, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT transaction_id, tenant_id, account_id, amount, currency, posted_date, description, running_balance, reconciliation_status, created_utc
            FROM bank_transactions
            WHERE tenant_id = $1 AND transaction_id = ANY($2)
            ORDER BY transaction_id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| ReconError::database("lock transactions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(BankTransaction::from).collect())
    }

    async fn lock_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoices"])
            .start_timer();

        let rows = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT invoice_id, tenant_id, account_id, counterparty_tax_id, counterparty_name, total, currency, issue_date, payment_method, payment_form, reconciliation_status, created_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = ANY($2)
            ORDER BY invoice_id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| ReconError::database("lock invoices", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    async fn lock_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<Option<SplitGroup>, ReconError> {
        let rows = sqlx::query_as::<_, SplitRow>(
            r#"
            SELECT split_id, split_group_id, tenant_id, transaction_id, invoice_id, allocated_amount, split_kind, created_by, created_utc, reversed_utc
            FROM reconciliation_splits
            WHERE tenant_id = $1 AND split_group_id = $2
            ORDER BY split_id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(split_group_id)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| ReconError::database("lock split group", e))?;

        Ok(group_splits(rows).into_iter().next())
    }

    async fn lock_msi_candidate(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<MsiCandidate>, ReconError> {
        let row = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT candidate_id, tenant_id, account_id, transaction_id, invoice_id, plan_length,
                   per_period_amount, remainder, confidence, source, runner_up_plan_length,
                   runner_up_relative_error, msi_status, created_utc
            FROM msi_candidates
            WHERE tenant_id = $1 AND candidate_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(candidate_id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(|e| ReconError::database("lock msi candidate", e))?;

        Ok(row.map(MsiCandidate::from))
    }

    async fn allocated_to_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT transaction_id, COALESCE(SUM(allocated_amount), 0)::BIGINT
            FROM reconciliation_splits
            WHERE tenant_id = $1 AND transaction_id = ANY($2) AND reversed_utc IS NULL
            GROUP BY transaction_id
            "#,
        )
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| ReconError::database("sum transaction allocations", e))?;

        let mut totals: HashMap<Uuid, i64> = ids.iter().map(|id| (*id, 0)).collect();
        totals.extend(rows);
        Ok(totals)
    }

    async fn allocated_to_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT invoice_id, COALESCE(SUM(allocated_amount), 0)::BIGINT
            FROM reconciliation_splits
            WHERE tenant_id = $1 AND invoice_id = ANY($2) AND reversed_utc IS NULL
            GROUP BY invoice_id
            "#,
        )
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(self.conn()?)
        .await
        .map_err(|e| ReconError::database("sum invoice allocations", e))?;

        let mut totals: HashMap<Uuid, i64> = ids.iter().map(|id| (*id, 0)).collect();
        totals.extend(rows);
        Ok(totals)
    }

    async fn insert_splits(&mut self, splits: &[ReconciliationSplit]) -> Result<(), ReconError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_splits"])
            .start_timer();

        for s in splits {
            sqlx::query(
                r#"
                INSERT INTO reconciliation_splits (split_id, split_group_id, tenant_id, transaction_id, invoice_id, allocated_amount, split_kind, created_by, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(s.split_id)
            .bind(s.split_group_id)
            .bind(s.tenant_id)
            .bind(s.transaction_id)
            .bind(s.invoice_id)
            .bind(s.allocated_amount)
            .bind(s.kind.as_str())
            .bind(&s.created_by)
            .bind(s.created_utc)
            .execute(self.conn()?)
            .await
            .map_err(|e| ReconError::database("insert split", e))?;
        }

        timer.observe_duration();
        Ok(())
    }

    async fn reverse_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
        reversed_utc: DateTime<Utc>,
    ) -> Result<(), ReconError> {
        sqlx::query(
            r#"
            UPDATE reconciliation_splits SET reversed_utc = $3
            WHERE tenant_id = $1 AND split_group_id = $2 AND reversed_utc IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(split_group_id)
        .bind(reversed_utc)
        .execute(self.conn()?)
        .await
        .map_err(|e| ReconError::database("reverse split group", e))?;
        Ok(())
    }

    async fn set_transaction_status(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError> {
        sqlx::query(
            "UPDATE bank_transactions SET reconciliation_status = $3 WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(status.as_str())
        .execute(self.conn()?)
        .await
        .map_err(|e| ReconError::database("update transaction status", e))?;
        Ok(())
    }

    async fn set_invoice_status(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError> {
        sqlx::query(
            "UPDATE invoices SET reconciliation_status = $3 WHERE tenant_id = $1 AND invoice_id = $2",
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(status.as_str())
        .execute(self.conn()?)
        .await
        .map_err(|e| ReconError::database("update invoice status", e))?;
        Ok(())
    }

    async fn set_msi_candidate_status(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
        status: MsiStatus,
    ) -> Result<(), ReconError> {
        sqlx::query(
            "UPDATE msi_candidates SET msi_status = $3 WHERE tenant_id = $1 AND candidate_id = $2",
        )
        .bind(tenant_id)
        .bind(candidate_id)
        .bind(status.as_str())
        .execute(self.conn()?)
        .await
        .map_err(|e| ReconError::database("update msi candidate status", e))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ReconError> {
        let tx = self.tx.take().ok_or_else(|| {
            ReconError::Storage(AppError::InternalError(anyhow::anyhow!(
                "unit of work already committed"
            )))
        })?;
        tx.commit()
            .await
            .map_err(|e| ReconError::database("commit unit of work", e))
    }
}
