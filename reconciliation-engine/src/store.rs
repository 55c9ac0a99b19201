//! Persistence seam for the engine.
//!
//! Every read and write is scoped by `tenant_id`. A row that exists under a
//! different tenant is reported as `InvalidScope`, never returned.

use crate::error::ReconError;
use crate::models::{
    Account, AccountKind, BankTransaction, DateWindow, EntityKind, Invoice, MsiCandidate,
    MsiStatus, NewAccount, NewBankTransaction, NewInvoice, Open, ReconciliationSplit,
    ReconciliationStatus, ReconciliationSummary, SplitGroup,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait EntityStore: Send + Sync {
    // Accounts
    async fn insert_account(&self, account: &NewAccount) -> Result<Account, ReconError>;
    async fn get_account(&self, tenant_id: Uuid, account_id: Uuid) -> Result<Account, ReconError>;
    /// Refused with `AccountKindLocked` once any transaction exists on the account.
    async fn update_account_kind(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        kind: AccountKind,
    ) -> Result<Account, ReconError>;

    // Transactions
    async fn insert_transaction(
        &self,
        transaction: &NewBankTransaction,
    ) -> Result<BankTransaction, ReconError>;
    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<BankTransaction, ReconError>;
    /// Refused with `ReferencedBySplit` while any split, reversed or not, points at it.
    async fn delete_transaction(&self, tenant_id: Uuid, transaction_id: Uuid)
        -> Result<(), ReconError>;

    // Invoices
    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ReconError>;
    async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, ReconError>;

    /// Transactions posted in `window` that are not fully reconciled.
    async fn open_transactions(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
        account_id: Option<Uuid>,
    ) -> Result<Vec<Open<BankTransaction>>, ReconError>;
    /// Invoices issued in `window` that are not fully reconciled.
    async fn open_invoices(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Open<Invoice>>, ReconError>;

    // Split ledger
    async fn get_split_group(
        &self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError>;
    async fn list_split_groups(
        &self,
        tenant_id: Uuid,
        include_reversed: bool,
    ) -> Result<Vec<SplitGroup>, ReconError>;
    async fn summary(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<ReconciliationSummary, ReconError>;

    // Installment candidates
    /// Persists new candidates, skipping any pair that already has a pending
    /// one. Returns what was actually stored.
    async fn save_msi_candidates(
        &self,
        candidates: &[MsiCandidate],
    ) -> Result<Vec<MsiCandidate>, ReconError>;
    async fn list_msi_candidates(
        &self,
        tenant_id: Uuid,
        status: Option<MsiStatus>,
    ) -> Result<Vec<MsiCandidate>, ReconError>;
    async fn get_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError>;
    /// Refused with `CandidateNotPending` unless the candidate is pending.
    async fn discard_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError>;

    /// Whether any of `ids` exists under a tenant other than `tenant_id`.
    /// Only used to tell `InvalidScope` from `NotFound`.
    async fn foreign_rows_exist(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<bool, ReconError>;

    /// Open a unit of work. Dropping it without `commit` discards every write.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, ReconError>;
}

/// One atomic unit of work over the split ledger.
///
/// Lock methods take row locks held until commit or drop. Callers lock a split
/// group or candidate first, then transactions, then invoices; each lock call
/// acquires in ascending id order. Rows of other tenants are silently skipped,
/// so the caller compares what came back against what it asked for.
#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<BankTransaction>, ReconError>;
    async fn lock_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, ReconError>;
    async fn lock_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<Option<SplitGroup>, ReconError>;
    async fn lock_msi_candidate(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<MsiCandidate>, ReconError>;

    /// Non-reversed allocated totals, including writes staged in this unit.
    async fn allocated_to_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError>;
    async fn allocated_to_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError>;

    async fn insert_splits(&mut self, splits: &[ReconciliationSplit]) -> Result<(), ReconError>;
    async fn reverse_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
        reversed_utc: DateTime<Utc>,
    ) -> Result<(), ReconError>;

    async fn set_transaction_status(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError>;
    async fn set_invoice_status(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError>;
    async fn set_msi_candidate_status(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
        status: MsiStatus,
    ) -> Result<(), ReconError>;

    async fn commit(&mut self) -> Result<(), ReconError>;
}

/// Split `requested` ids into found and missing, then classify the missing ones.
pub async fn missing_ref_error(
    store: &dyn EntityStore,
    tenant_id: Uuid,
    kind: EntityKind,
    requested: &[Uuid],
    found: &[Uuid],
) -> Result<(), ReconError> {
    let missing: Vec<Uuid> = requested
        .iter()
        .copied()
        .filter(|id| !found.contains(id))
        .collect();
    let Some(first) = missing.first().copied() else {
        return Ok(());
    };
    if store.foreign_rows_exist(tenant_id, kind, &missing).await? {
        return Err(ReconError::scope(format!(
            "{} reference outside tenant {}",
            kind.as_str(),
            tenant_id
        )));
    }
    Err(ReconError::not_found(kind, first))
}
