//! In-process entity store.
//!
//! Backs tests and single-process deployments that run without Postgres.
//! Row locks are per-id async mutexes; a unit of work stages its writes and
//! applies them under the state write lock on commit.

use crate::error::{ConflictInvariant, ReconError};
use crate::models::{
    Account, AccountKind, BankTransaction, DateWindow, EntityKind, EntityRef, Invoice,
    MsiCandidate, MsiStatus, NewAccount, NewBankTransaction, NewInvoice, Open,
    ReconciliationSplit, ReconciliationStatus, ReconciliationSummary, SplitGroup, StatusTotals,
};
use crate::store::{EntityStore, LedgerTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    transactions: HashMap<Uuid, BankTransaction>,
    invoices: HashMap<Uuid, Invoice>,
    splits: Vec<ReconciliationSplit>,
    candidates: HashMap<Uuid, MsiCandidate>,
}

impl State {
    fn exists_elsewhere(&self, tenant_id: Uuid, kind: EntityKind, id: Uuid) -> bool {
        match kind {
            EntityKind::Account => self.accounts.get(&id).is_some_and(|a| a.tenant_id != tenant_id),
            EntityKind::Transaction => self
                .transactions
                .get(&id)
                .is_some_and(|t| t.tenant_id != tenant_id),
            EntityKind::Invoice => self.invoices.get(&id).is_some_and(|i| i.tenant_id != tenant_id),
            EntityKind::SplitGroup => self
                .splits
                .iter()
                .any(|s| s.split_group_id == id && s.tenant_id != tenant_id),
            EntityKind::MsiCandidate => self
                .candidates
                .get(&id)
                .is_some_and(|c| c.tenant_id != tenant_id),
        }
    }

    /// Error for a row that is not visible to `tenant_id`.
    fn missing(&self, tenant_id: Uuid, kind: EntityKind, id: Uuid) -> ReconError {
        if self.exists_elsewhere(tenant_id, kind, id) {
            ReconError::scope(format!(
                "{} belongs to another tenant",
                EntityRef { kind, id }
            ))
        } else {
            ReconError::not_found(kind, id)
        }
    }

    fn account(&self, tenant_id: Uuid, account_id: Uuid) -> Result<&Account, ReconError> {
        self.accounts
            .get(&account_id)
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| self.missing(tenant_id, EntityKind::Account, account_id))
    }

    fn candidate(&self, tenant_id: Uuid, candidate_id: Uuid) -> Result<&MsiCandidate, ReconError> {
        self.candidates
            .get(&candidate_id)
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or_else(|| self.missing(tenant_id, EntityKind::MsiCandidate, candidate_id))
    }

    fn group(&self, tenant_id: Uuid, split_group_id: Uuid) -> Option<SplitGroup> {
        let splits: Vec<ReconciliationSplit> = self
            .splits
            .iter()
            .filter(|s| s.split_group_id == split_group_id && s.tenant_id == tenant_id)
            .cloned()
            .collect();
        SplitGroup::from_splits(splits)
    }

    fn allocated_to_transaction(&self, tenant_id: Uuid, transaction_id: Uuid) -> i64 {
        allocated(self, &[], tenant_id, &[transaction_id], |s| s.transaction_id)
            .get(&transaction_id)
            .copied()
            .unwrap_or(0)
    }

    fn allocated_to_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> i64 {
        allocated(self, &[], tenant_id, &[invoice_id], |s| s.invoice_id)
            .get(&invoice_id)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
enum Staged {
    Splits(Vec<ReconciliationSplit>),
    Reverse {
        tenant_id: Uuid,
        split_group_id: Uuid,
        reversed_utc: DateTime<Utc>,
    },
    TransactionStatus(Uuid, Uuid, ReconciliationStatus),
    InvoiceStatus(Uuid, Uuid, ReconciliationStatus),
    CandidateStatus(Uuid, Uuid, MsiStatus),
}

/// Non-reversed allocation totals per id, counting staged writes.
fn allocated<F>(
    state: &State,
    staged: &[Staged],
    tenant_id: Uuid,
    ids: &[Uuid],
    key: F,
) -> HashMap<Uuid, i64>
where
    F: Fn(&ReconciliationSplit) -> Uuid,
{
    let reversed: HashSet<Uuid> = staged
        .iter()
        .filter_map(|s| match s {
            Staged::Reverse { split_group_id, .. } => Some(*split_group_id),
            _ => None,
        })
        .collect();
    let staged_splits = staged.iter().flat_map(|s| match s {
        Staged::Splits(splits) => splits.as_slice(),
        _ => &[][..],
    });

    let mut totals: HashMap<Uuid, i64> = ids.iter().map(|id| (*id, 0)).collect();
    for split in state.splits.iter().chain(staged_splits) {
        if split.tenant_id != tenant_id
            || split.reversed_utc.is_some()
            || reversed.contains(&split.split_group_id)
        {
            continue;
        }
        if let Some(total) = totals.get_mut(&key(split)) {
            *total += split.allocated_amount;
        }
    }
    totals
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    row_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_row(&self, id: Uuid) -> OwnedMutexGuard<()> {
        lock_row(&self.row_locks, id).await
    }
}

async fn lock_row(locks: &DashMap<Uuid, Arc<Mutex<()>>>, id: Uuid) -> OwnedMutexGuard<()> {
    let mutex = locks.entry(id).or_default().clone();
    mutex.lock_owned().await
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn insert_account(&self, account: &NewAccount) -> Result<Account, ReconError> {
        let created = Account {
            account_id: Uuid::new_v4(),
            tenant_id: account.tenant_id,
            kind: account.kind,
            currency: account.currency.clone(),
            created_utc: Utc::now(),
        };
        self.state
            .write()
            .await
            .accounts
            .insert(created.account_id, created.clone());
        Ok(created)
    }

    async fn get_account(&self, tenant_id: Uuid, account_id: Uuid) -> Result<Account, ReconError> {
        let state = self.state.read().await;
        state.account(tenant_id, account_id).cloned()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id))]
    async fn update_account_kind(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        kind: AccountKind,
    ) -> Result<Account, ReconError> {
        let mut state = self.state.write().await;
        let current = state.account(tenant_id, account_id)?.kind;
        if current == kind {
            return state.account(tenant_id, account_id).cloned();
        }
        let in_use = state
            .transactions
            .values()
            .any(|t| t.account_id == account_id && t.tenant_id == tenant_id);
        if in_use {
            return Err(ReconError::conflict(
                EntityRef::account(account_id),
                ConflictInvariant::AccountKindLocked,
                "account already has transactions",
            ));
        }
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| ReconError::not_found(EntityKind::Account, account_id))?;
        account.kind = kind;
        Ok(account.clone())
    }

    async fn insert_transaction(
        &self,
        transaction: &NewBankTransaction,
    ) -> Result<BankTransaction, ReconError> {
        let mut state = self.state.write().await;
        let currency = state
            .account(transaction.tenant_id, transaction.account_id)?
            .currency
            .clone();
        let created = BankTransaction {
            transaction_id: Uuid::new_v4(),
            tenant_id: transaction.tenant_id,
            account_id: transaction.account_id,
            amount: transaction.amount,
            currency,
            posted_date: transaction.posted_date,
            description: transaction.description.clone(),
            running_balance: transaction.running_balance,
            status: ReconciliationStatus::Unreconciled,
            created_utc: Utc::now(),
        };
        state
            .transactions
            .insert(created.transaction_id, created.clone());
        Ok(created)
    }

    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<BankTransaction, ReconError> {
        let state = self.state.read().await;
        state
            .transactions
            .get(&transaction_id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| state.missing(tenant_id, EntityKind::Transaction, transaction_id))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn delete_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), ReconError> {
        let _row = self.lock_row(transaction_id).await;
        let mut state = self.state.write().await;
        let visible = state
            .transactions
            .get(&transaction_id)
            .is_some_and(|t| t.tenant_id == tenant_id);
        if !visible {
            return Err(state.missing(tenant_id, EntityKind::Transaction, transaction_id));
        }
        if state.splits.iter().any(|s| s.transaction_id == transaction_id) {
            return Err(ReconError::conflict(
                EntityRef::transaction(transaction_id),
                ConflictInvariant::ReferencedBySplit,
                "transaction is referenced by the split ledger",
            ));
        }
        state.transactions.remove(&transaction_id);
        state
            .candidates
            .retain(|_, c| c.transaction_id != transaction_id);
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ReconError> {
        let mut state = self.state.write().await;
        if let Some(account_id) = invoice.account_id {
            state.account(invoice.tenant_id, account_id)?;
        }
        let created = Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: invoice.tenant_id,
            account_id: invoice.account_id,
            counterparty_tax_id: invoice.counterparty_tax_id.clone(),
            counterparty_name: invoice.counterparty_name.clone(),
            total: invoice.total,
            currency: invoice.currency.clone(),
            issue_date: invoice.issue_date,
            payment_method: invoice.payment_method,
            payment_form: invoice.payment_form.clone(),
            status: ReconciliationStatus::Unreconciled,
            created_utc: Utc::now(),
        };
        state.invoices.insert(created.invoice_id, created.clone());
        Ok(created)
    }

    async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, ReconError> {
        let state = self.state.read().await;
        state
            .invoices
            .get(&invoice_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| state.missing(tenant_id, EntityKind::Invoice, invoice_id))
    }

    async fn open_transactions(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
        account_id: Option<Uuid>,
    ) -> Result<Vec<Open<BankTransaction>>, ReconError> {
        window.validate()?;
        let state = self.state.read().await;
        let mut open: Vec<Open<BankTransaction>> = state
            .transactions
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && window.contains(t.posted_date)
                    && account_id.map_or(true, |a| t.account_id == a)
                    && t.status != ReconciliationStatus::Reconciled
            })
            .map(|t| Open {
                allocated: state.allocated_to_transaction(tenant_id, t.transaction_id),
                item: t.clone(),
            })
            .collect();
        open.sort_by(|a, b| {
            a.item
                .posted_date
                .cmp(&b.item.posted_date)
                .then(a.item.transaction_id.cmp(&b.item.transaction_id))
        });
        Ok(open)
    }

    async fn open_invoices(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Open<Invoice>>, ReconError> {
        window.validate()?;
        let state = self.state.read().await;
        let mut open: Vec<Open<Invoice>> = state
            .invoices
            .values()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && window.contains(i.issue_date)
                    && i.status != ReconciliationStatus::Reconciled
            })
            .map(|i| Open {
                allocated: state.allocated_to_invoice(tenant_id, i.invoice_id),
                item: i.clone(),
            })
            .collect();
        open.sort_by(|a, b| {
            a.item
                .issue_date
                .cmp(&b.item.issue_date)
                .then(a.item.invoice_id.cmp(&b.item.invoice_id))
        });
        Ok(open)
    }

    async fn get_split_group(
        &self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError> {
        let state = self.state.read().await;
        state
            .group(tenant_id, split_group_id)
            .ok_or_else(|| state.missing(tenant_id, EntityKind::SplitGroup, split_group_id))
    }

    async fn list_split_groups(
        &self,
        tenant_id: Uuid,
        include_reversed: bool,
    ) -> Result<Vec<SplitGroup>, ReconError> {
        let state = self.state.read().await;
        let mut grouped: BTreeMap<Uuid, Vec<ReconciliationSplit>> = BTreeMap::new();
        for split in state.splits.iter().filter(|s| s.tenant_id == tenant_id) {
            grouped
                .entry(split.split_group_id)
                .or_default()
                .push(split.clone());
        }
        let mut groups: Vec<SplitGroup> = grouped
            .into_values()
            .filter_map(SplitGroup::from_splits)
            .filter(|g| include_reversed || !g.is_reversed())
            .collect();
        groups.sort_by(|a, b| {
            a.created_utc
                .cmp(&b.created_utc)
                .then(a.split_group_id.cmp(&b.split_group_id))
        });
        Ok(groups)
    }

    async fn summary(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<ReconciliationSummary, ReconError> {
        window.validate()?;
        let state = self.state.read().await;
        let mut transactions = StatusTotals::default();
        for t in state
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant_id && window.contains(t.posted_date))
        {
            let allocated = state.allocated_to_transaction(tenant_id, t.transaction_id);
            transactions.record(t.status, t.magnitude(), allocated);
        }
        let mut invoices = StatusTotals::default();
        for i in state
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && window.contains(i.issue_date))
        {
            let allocated = state.allocated_to_invoice(tenant_id, i.invoice_id);
            invoices.record(i.status, i.total, allocated);
        }
        Ok(ReconciliationSummary {
            tenant_id,
            window,
            transactions,
            invoices,
        })
    }

    async fn save_msi_candidates(
        &self,
        candidates: &[MsiCandidate],
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        let mut state = self.state.write().await;
        let mut saved = Vec::new();
        for candidate in candidates {
            let duplicate = state.candidates.values().any(|c| {
                c.tenant_id == candidate.tenant_id
                    && c.transaction_id == candidate.transaction_id
                    && c.invoice_id == candidate.invoice_id
                    && c.status == MsiStatus::Pending
            });
            if duplicate {
                continue;
            }
            state
                .candidates
                .insert(candidate.candidate_id, candidate.clone());
            saved.push(candidate.clone());
        }
        Ok(saved)
    }

    async fn list_msi_candidates(
        &self,
        tenant_id: Uuid,
        status: Option<MsiStatus>,
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        let state = self.state.read().await;
        let mut found: Vec<MsiCandidate> = state
            .candidates
            .values()
            .filter(|c| c.tenant_id == tenant_id && status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });
        Ok(found)
    }

    async fn get_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError> {
        let state = self.state.read().await;
        state.candidate(tenant_id, candidate_id).cloned()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    async fn discard_msi_candidate(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError> {
        let _row = self.lock_row(candidate_id).await;
        let mut state = self.state.write().await;
        if state.candidate(tenant_id, candidate_id)?.status != MsiStatus::Pending {
            return Err(ReconError::conflict(
                EntityRef::msi_candidate(candidate_id),
                ConflictInvariant::CandidateNotPending,
                "candidate already resolved",
            ));
        }
        let candidate = state
            .candidates
            .get_mut(&candidate_id)
            .ok_or_else(|| ReconError::not_found(EntityKind::MsiCandidate, candidate_id))?;
        candidate.status = MsiStatus::Discarded;
        Ok(candidate.clone())
    }

    async fn foreign_rows_exist(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<bool, ReconError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .any(|id| state.exists_elsewhere(tenant_id, kind, *id)))
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, ReconError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            row_locks: Arc::clone(&self.row_locks),
            guards: Vec::new(),
            held: HashSet::new(),
            staged: Vec::new(),
        }))
    }
}

/// Unit of work over [`InMemoryStore`]. Row guards are released on drop.
pub struct MemoryTx {
    state: Arc<RwLock<State>>,
    row_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    guards: Vec<OwnedMutexGuard<()>>,
    held: HashSet<Uuid>,
    staged: Vec<Staged>,
}

impl MemoryTx {
    async fn lock_ids(&mut self, ids: &[Uuid]) {
        let mut sorted: Vec<Uuid> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        for id in sorted {
            if self.held.insert(id) {
                let guard = lock_row(&self.row_locks, id).await;
                self.guards.push(guard);
            }
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<BankTransaction>, ReconError> {
        self.lock_ids(ids).await;
        let state = self.state.read().await;
        let mut rows: Vec<BankTransaction> = ids
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.transaction_id);
        rows.dedup_by_key(|t| t.transaction_id);
        Ok(rows)
    }

    async fn lock_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, ReconError> {
        self.lock_ids(ids).await;
        let state = self.state.read().await;
        let mut rows: Vec<Invoice> = ids
            .iter()
            .filter_map(|id| state.invoices.get(id))
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.invoice_id);
        rows.dedup_by_key(|i| i.invoice_id);
        Ok(rows)
    }

    async fn lock_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<Option<SplitGroup>, ReconError> {
        self.lock_ids(&[split_group_id]).await;
        let state = self.state.read().await;
        Ok(state.group(tenant_id, split_group_id))
    }

    async fn lock_msi_candidate(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Option<MsiCandidate>, ReconError> {
        self.lock_ids(&[candidate_id]).await;
        let state = self.state.read().await;
        Ok(state
            .candidates
            .get(&candidate_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn allocated_to_transactions(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError> {
        let state = self.state.read().await;
        Ok(allocated(&state, &self.staged, tenant_id, ids, |s| {
            s.transaction_id
        }))
    }

    async fn allocated_to_invoices(
        &mut self,
        tenant_id: Uuid,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, ReconError> {
        let state = self.state.read().await;
        Ok(allocated(&state, &self.staged, tenant_id, ids, |s| s.invoice_id))
    }

    async fn insert_splits(&mut self, splits: &[ReconciliationSplit]) -> Result<(), ReconError> {
        self.staged.push(Staged::Splits(splits.to_vec()));
        Ok(())
    }

    async fn reverse_split_group(
        &mut self,
        tenant_id: Uuid,
        split_group_id: Uuid,
        reversed_utc: DateTime<Utc>,
    ) -> Result<(), ReconError> {
        self.staged.push(Staged::Reverse {
            tenant_id,
            split_group_id,
            reversed_utc,
        });
        Ok(())
    }

    async fn set_transaction_status(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError> {
        self.staged
            .push(Staged::TransactionStatus(tenant_id, transaction_id, status));
        Ok(())
    }

    async fn set_invoice_status(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError> {
        self.staged
            .push(Staged::InvoiceStatus(tenant_id, invoice_id, status));
        Ok(())
    }

    async fn set_msi_candidate_status(
        &mut self,
        tenant_id: Uuid,
        candidate_id: Uuid,
        status: MsiStatus,
    ) -> Result<(), ReconError> {
        self.staged
            .push(Staged::CandidateStatus(tenant_id, candidate_id, status));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ReconError> {
        let mut state = self.state.write().await;
        let staged = std::mem::take(&mut self.staged);
        let writes = staged.len();
        for op in staged {
            match op {
                Staged::Splits(splits) => state.splits.extend(splits),
                Staged::Reverse {
                    tenant_id,
                    split_group_id,
                    reversed_utc,
                } => {
                    for split in state.splits.iter_mut().filter(|s| {
                        s.split_group_id == split_group_id
                            && s.tenant_id == tenant_id
                            && s.reversed_utc.is_none()
                    }) {
                        split.reversed_utc = Some(reversed_utc);
                    }
                }
                Staged::TransactionStatus(tenant_id, id, status) => {
                    if let Some(t) = state
                        .transactions
                        .get_mut(&id)
                        .filter(|t| t.tenant_id == tenant_id)
                    {
                        t.status = status;
                    }
                }
                Staged::InvoiceStatus(tenant_id, id, status) => {
                    if let Some(i) = state
                        .invoices
                        .get_mut(&id)
                        .filter(|i| i.tenant_id == tenant_id)
                    {
                        i.status = status;
                    }
                }
                Staged::CandidateStatus(tenant_id, id, status) => {
                    if let Some(c) = state
                        .candidates
                        .get_mut(&id)
                        .filter(|c| c.tenant_id == tenant_id)
                    {
                        c.status = status;
                    }
                }
            }
        }
        drop(state);
        self.guards.clear();
        self.held.clear();
        info!(writes = writes, "In-memory unit of work committed");
        Ok(())
    }
}
