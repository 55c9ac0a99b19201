//! Atomic apply / undo of split groups over the entity store.
//!
//! Every operation runs in one [`LedgerTx`]: locks first, then validation,
//! then writes, then commit. Any error drops the unit of work, which discards
//! everything staged so far.

use crate::error::{ConflictInvariant, ReconError};
use crate::models::{
    BankTransaction, EntityKind, EntityRef, Invoice, MsiStatus, ReconciliationSplit,
    ReconciliationStatus, SplitGroup, SplitKind, Suggestion,
};
use crate::store::{missing_ref_error, EntityStore, LedgerTx};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SplitApplier {
    amount_tolerance: f64,
}

impl SplitApplier {
    /// `amount_tolerance` bounds how far a split suggestion's allocations may
    /// drift from the funding side's remaining amount.
    pub fn new(amount_tolerance: f64) -> Self {
        Self { amount_tolerance }
    }

    #[instrument(skip(self, store, suggestion), fields(tenant_id = %tenant_id, kind = suggestion.kind.as_str()))]
    pub async fn apply(
        &self,
        store: &dyn EntityStore,
        tenant_id: Uuid,
        suggestion: &Suggestion,
        created_by: &str,
    ) -> Result<SplitGroup, ReconError> {
        let tx_ids = sorted_ids(
            suggestion
                .transaction_refs
                .iter()
                .copied()
                .chain(suggestion.allocations.iter().map(|a| a.transaction_id)),
        );
        let inv_ids = sorted_ids(
            suggestion
                .invoice_refs
                .iter()
                .copied()
                .chain(suggestion.allocations.iter().map(|a| a.invoice_id)),
        );

        let mut unit = store.begin().await?;
        let transactions = lock_transactions(store, unit.as_mut(), tenant_id, &tx_ids).await?;
        let invoices = lock_invoices(store, unit.as_mut(), tenant_id, &inv_ids).await?;

        validate_shape(suggestion, &transactions, &invoices)?;

        let tx_allocated = unit.allocated_to_transactions(tenant_id, &tx_ids).await?;
        let inv_allocated = unit.allocated_to_invoices(tenant_id, &inv_ids).await?;

        self.check_sum(suggestion, &transactions, &invoices, &tx_allocated, &inv_allocated)?;
        check_overflow(suggestion, &transactions, &invoices, &tx_allocated, &inv_allocated)?;

        let split_group_id = Uuid::new_v4();
        let created_utc = Utc::now();
        let splits: Vec<ReconciliationSplit> = suggestion
            .allocations
            .iter()
            .map(|a| ReconciliationSplit {
                split_id: Uuid::new_v4(),
                split_group_id,
                tenant_id,
                transaction_id: a.transaction_id,
                invoice_id: a.invoice_id,
                allocated_amount: a.amount,
                kind: suggestion.kind,
                created_by: created_by.to_string(),
                created_utc,
                reversed_utc: None,
            })
            .collect();

        unit.insert_splits(&splits).await?;
        refresh_statuses(unit.as_mut(), tenant_id, &transactions, &invoices).await?;
        unit.commit().await?;

        info!(
            split_group_id = %split_group_id,
            splits = splits.len(),
            "Split group applied"
        );

        SplitGroup::from_splits(splits)
            .ok_or_else(|| malformed(suggestion, "suggestion has no allocations"))
    }

    /// Reverse every split of a group. A group that is already reversed is
    /// returned unchanged without writing anything.
    #[instrument(skip(self, store), fields(tenant_id = %tenant_id, split_group_id = %split_group_id))]
    pub async fn undo(
        &self,
        store: &dyn EntityStore,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError> {
        let mut unit = store.begin().await?;
        let Some(group) = unit.lock_split_group(tenant_id, split_group_id).await? else {
            drop(unit);
            missing_ref_error(
                store,
                tenant_id,
                EntityKind::SplitGroup,
                &[split_group_id],
                &[],
            )
            .await?;
            return Err(ReconError::not_found(EntityKind::SplitGroup, split_group_id));
        };

        if group.is_reversed() {
            debug!("Split group already reversed");
            return Ok(group);
        }

        let tx_ids = sorted_ids(group.splits.iter().map(|s| s.transaction_id));
        let inv_ids = sorted_ids(group.splits.iter().map(|s| s.invoice_id));
        let transactions = lock_transactions(store, unit.as_mut(), tenant_id, &tx_ids).await?;
        let invoices = lock_invoices(store, unit.as_mut(), tenant_id, &inv_ids).await?;

        let reversed_utc = Utc::now();
        unit.reverse_split_group(tenant_id, split_group_id, reversed_utc)
            .await?;
        refresh_statuses(unit.as_mut(), tenant_id, &transactions, &invoices).await?;
        unit.commit().await?;

        info!(splits = group.splits.len(), "Split group reversed");

        let splits = group
            .splits
            .into_iter()
            .map(|s| ReconciliationSplit {
                reversed_utc: Some(reversed_utc),
                ..s
            })
            .collect();
        SplitGroup::from_splits(splits)
            .ok_or_else(|| ReconError::not_found(EntityKind::SplitGroup, split_group_id))
    }

    /// Promote a pending installment candidate into a one-to-one split for one
    /// period, and mark it accepted in the same unit of work.
    #[instrument(skip(self, store), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    pub async fn accept_installment(
        &self,
        store: &dyn EntityStore,
        tenant_id: Uuid,
        candidate_id: Uuid,
        created_by: &str,
    ) -> Result<SplitGroup, ReconError> {
        let mut unit = store.begin().await?;
        let Some(candidate) = unit.lock_msi_candidate(tenant_id, candidate_id).await? else {
            drop(unit);
            missing_ref_error(
                store,
                tenant_id,
                EntityKind::MsiCandidate,
                &[candidate_id],
                &[],
            )
            .await?;
            return Err(ReconError::not_found(EntityKind::MsiCandidate, candidate_id));
        };
        if candidate.status != MsiStatus::Pending {
            return Err(ReconError::conflict(
                EntityRef::msi_candidate(candidate_id),
                ConflictInvariant::CandidateNotPending,
                format!("candidate is {}", candidate.status.as_str()),
            ));
        }

        let tx_ids = [candidate.transaction_id];
        let inv_ids = [candidate.invoice_id];
        let transactions = lock_transactions(store, unit.as_mut(), tenant_id, &tx_ids).await?;
        let invoices = lock_invoices(store, unit.as_mut(), tenant_id, &inv_ids).await?;
        let tx_allocated = unit.allocated_to_transactions(tenant_id, &tx_ids).await?;
        let inv_allocated = unit.allocated_to_invoices(tenant_id, &inv_ids).await?;

        let tx_remaining = transactions
            .iter()
            .map(|t| t.magnitude() - allocated_of(&tx_allocated, t.transaction_id))
            .sum::<i64>();
        let inv_remaining = invoices
            .iter()
            .map(|i| i.total - allocated_of(&inv_allocated, i.invoice_id))
            .sum::<i64>();

        if tx_remaining <= 0 {
            return Err(ReconError::conflict(
                EntityRef::transaction(candidate.transaction_id),
                ConflictInvariant::TransactionOverflow,
                "transaction is already fully allocated",
            ));
        }
        if inv_remaining <= 0 {
            return Err(ReconError::conflict(
                EntityRef::invoice(candidate.invoice_id),
                ConflictInvariant::InvoiceOverflow,
                "invoice is already fully allocated",
            ));
        }
        let amount = candidate
            .per_period_amount
            .min(tx_remaining)
            .min(inv_remaining);

        let split = ReconciliationSplit {
            split_id: Uuid::new_v4(),
            split_group_id: Uuid::new_v4(),
            tenant_id,
            transaction_id: candidate.transaction_id,
            invoice_id: candidate.invoice_id,
            allocated_amount: amount,
            kind: SplitKind::OneToOne,
            created_by: created_by.to_string(),
            created_utc: Utc::now(),
            reversed_utc: None,
        };

        unit.insert_splits(std::slice::from_ref(&split)).await?;
        refresh_statuses(unit.as_mut(), tenant_id, &transactions, &invoices).await?;
        unit.set_msi_candidate_status(tenant_id, candidate_id, MsiStatus::Accepted)
            .await?;
        unit.commit().await?;

        info!(
            split_group_id = %split.split_group_id,
            amount = amount,
            plan_length = candidate.plan_length,
            "Installment candidate accepted"
        );

        SplitGroup::from_splits(vec![split])
            .ok_or_else(|| ReconError::not_found(EntityKind::MsiCandidate, candidate_id))
    }

    /// One-to-many allocations must add up to the transaction's remaining
    /// amount within tolerance; many-to-one to the invoice's.
    fn check_sum(
        &self,
        suggestion: &Suggestion,
        transactions: &[BankTransaction],
        invoices: &[Invoice],
        tx_allocated: &HashMap<Uuid, i64>,
        inv_allocated: &HashMap<Uuid, i64>,
    ) -> Result<(), ReconError> {
        let (entity, remaining) = match suggestion.kind {
            SplitKind::OneToOne => return Ok(()),
            SplitKind::OneToMany => {
                let Some(t) = transactions.first() else {
                    return Err(malformed(suggestion, "missing funding transaction"));
                };
                (
                    EntityRef::transaction(t.transaction_id),
                    t.magnitude() - allocated_of(tx_allocated, t.transaction_id),
                )
            }
            SplitKind::ManyToOne => {
                let Some(i) = invoices.first() else {
                    return Err(malformed(suggestion, "missing funded invoice"));
                };
                (
                    EntityRef::invoice(i.invoice_id),
                    i.total - allocated_of(inv_allocated, i.invoice_id),
                )
            }
        };

        let slack = (remaining.max(0) as f64 * self.amount_tolerance).floor() as i64;
        let Some(allocated_sum) = checked_total(suggestion.allocations.iter().map(|a| a.amount))
        else {
            return Err(ReconError::conflict(
                entity,
                ConflictInvariant::AllocationSumMismatch,
                "allocations overflow when summed",
            ));
        };
        let off_by = allocated_sum.checked_sub(remaining).map(i64::unsigned_abs);
        if off_by.map_or(true, |d| d > slack.unsigned_abs()) {
            return Err(ReconError::conflict(
                entity,
                ConflictInvariant::AllocationSumMismatch,
                format!(
                    "allocations sum to {} against {} remaining (tolerance {})",
                    allocated_sum, remaining, slack
                ),
            ));
        }
        Ok(())
    }
}

fn sorted_ids(ids: impl Iterator<Item = Uuid>) -> Vec<Uuid> {
    ids.collect::<BTreeSet<Uuid>>().into_iter().collect()
}

fn checked_total(amounts: impl Iterator<Item = i64>) -> Option<i64> {
    amounts.fold(Some(0i64), |acc, a| acc.and_then(|sum| sum.checked_add(a)))
}

fn allocated_of(totals: &HashMap<Uuid, i64>, id: Uuid) -> i64 {
    totals.get(&id).copied().unwrap_or(0)
}

fn malformed(suggestion: &Suggestion, detail: impl Into<String>) -> ReconError {
    let entity = suggestion
        .transaction_refs
        .first()
        .map(|id| EntityRef::transaction(*id))
        .or_else(|| suggestion.invoice_refs.first().map(|id| EntityRef::invoice(*id)))
        .unwrap_or_else(|| EntityRef::transaction(Uuid::nil()));
    ReconError::conflict(entity, ConflictInvariant::MalformedSuggestion, detail)
}

async fn lock_transactions(
    store: &dyn EntityStore,
    unit: &mut dyn LedgerTx,
    tenant_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<BankTransaction>, ReconError> {
    let rows = unit.lock_transactions(tenant_id, ids).await?;
    let found: Vec<Uuid> = rows.iter().map(|t| t.transaction_id).collect();
    missing_ref_error(store, tenant_id, EntityKind::Transaction, ids, &found).await?;
    Ok(rows)
}

async fn lock_invoices(
    store: &dyn EntityStore,
    unit: &mut dyn LedgerTx,
    tenant_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<Invoice>, ReconError> {
    let rows = unit.lock_invoices(tenant_id, ids).await?;
    let found: Vec<Uuid> = rows.iter().map(|i| i.invoice_id).collect();
    missing_ref_error(store, tenant_id, EntityKind::Invoice, ids, &found).await?;
    Ok(rows)
}

/// Structural checks that need no ledger state.
fn validate_shape(
    suggestion: &Suggestion,
    transactions: &[BankTransaction],
    invoices: &[Invoice],
) -> Result<(), ReconError> {
    if suggestion.allocations.is_empty() {
        return Err(malformed(suggestion, "suggestion has no allocations"));
    }
    if let Some(a) = suggestion.allocations.iter().find(|a| a.amount <= 0) {
        return Err(malformed(
            suggestion,
            format!("non-positive allocation of {}", a.amount),
        ));
    }

    let tx_refs: BTreeSet<Uuid> = suggestion.transaction_refs.iter().copied().collect();
    let inv_refs: BTreeSet<Uuid> = suggestion.invoice_refs.iter().copied().collect();
    let tx_alloc: BTreeSet<Uuid> = suggestion.allocations.iter().map(|a| a.transaction_id).collect();
    let inv_alloc: BTreeSet<Uuid> = suggestion.allocations.iter().map(|a| a.invoice_id).collect();
    if tx_refs != tx_alloc || inv_refs != inv_alloc {
        return Err(malformed(
            suggestion,
            "allocations do not cover exactly the referenced rows",
        ));
    }
    if tx_refs.len() != suggestion.transaction_refs.len()
        || inv_refs.len() != suggestion.invoice_refs.len()
    {
        return Err(malformed(suggestion, "duplicate references"));
    }

    let mut pairs = HashSet::new();
    if !suggestion
        .allocations
        .iter()
        .all(|a| pairs.insert((a.transaction_id, a.invoice_id)))
    {
        return Err(malformed(suggestion, "duplicate allocation pair"));
    }

    let shape_ok = match suggestion.kind {
        SplitKind::OneToOne => tx_refs.len() == 1 && inv_refs.len() == 1,
        SplitKind::OneToMany => tx_refs.len() == 1 && inv_refs.len() >= 2,
        SplitKind::ManyToOne => tx_refs.len() >= 2 && inv_refs.len() == 1,
    };
    if !shape_ok {
        return Err(malformed(
            suggestion,
            format!(
                "{} with {} transactions and {} invoices",
                suggestion.kind.as_str(),
                tx_refs.len(),
                inv_refs.len()
            ),
        ));
    }

    let currencies: HashMap<Uuid, &str> = transactions
        .iter()
        .map(|t| (t.transaction_id, t.currency.as_str()))
        .chain(invoices.iter().map(|i| (i.invoice_id, i.currency.as_str())))
        .collect();
    for a in &suggestion.allocations {
        if currencies.get(&a.transaction_id) != currencies.get(&a.invoice_id) {
            return Err(malformed(suggestion, "allocation pairs different currencies"));
        }
    }

    // No single allocation may exceed either row it touches.
    let ceilings: HashMap<Uuid, i64> = transactions
        .iter()
        .map(|t| (t.transaction_id, t.magnitude()))
        .chain(invoices.iter().map(|i| (i.invoice_id, i.total)))
        .collect();
    for a in &suggestion.allocations {
        let tx_ceiling = ceilings.get(&a.transaction_id).copied().unwrap_or(0);
        let inv_ceiling = ceilings.get(&a.invoice_id).copied().unwrap_or(0);
        if a.amount > tx_ceiling.min(inv_ceiling) {
            return Err(malformed(
                suggestion,
                format!(
                    "allocation of {} exceeds its rows ({} / {})",
                    a.amount, tx_ceiling, inv_ceiling
                ),
            ));
        }
    }
    Ok(())
}

/// Existing plus new allocations may never exceed a row's amount.
fn check_overflow(
    suggestion: &Suggestion,
    transactions: &[BankTransaction],
    invoices: &[Invoice],
    tx_allocated: &HashMap<Uuid, i64>,
    inv_allocated: &HashMap<Uuid, i64>,
) -> Result<(), ReconError> {
    for t in transactions {
        let existing = allocated_of(tx_allocated, t.transaction_id);
        let incoming = checked_total(
            suggestion
                .allocations
                .iter()
                .filter(|a| a.transaction_id == t.transaction_id)
                .map(|a| a.amount),
        );
        let claimed = incoming.and_then(|i| i.checked_add(existing));
        if claimed.map_or(true, |c| c > t.magnitude()) {
            return Err(ReconError::conflict(
                EntityRef::transaction(t.transaction_id),
                ConflictInvariant::TransactionOverflow,
                format!(
                    "{} allocated + {} requested exceeds {}",
                    existing,
                    incoming.unwrap_or(i64::MAX),
                    t.magnitude()
                ),
            ));
        }
    }
    for i in invoices {
        let existing = allocated_of(inv_allocated, i.invoice_id);
        let incoming = checked_total(
            suggestion
                .allocations
                .iter()
                .filter(|a| a.invoice_id == i.invoice_id)
                .map(|a| a.amount),
        );
        let claimed = incoming.and_then(|n| n.checked_add(existing));
        if claimed.map_or(true, |c| c > i.total) {
            return Err(ReconError::conflict(
                EntityRef::invoice(i.invoice_id),
                ConflictInvariant::InvoiceOverflow,
                format!(
                    "{} allocated + {} requested exceeds {}",
                    existing,
                    incoming.unwrap_or(i64::MAX),
                    i.total
                ),
            ));
        }
    }
    Ok(())
}

/// Recompute cached statuses from the ledger as staged in `unit`.
async fn refresh_statuses(
    unit: &mut dyn LedgerTx,
    tenant_id: Uuid,
    transactions: &[BankTransaction],
    invoices: &[Invoice],
) -> Result<(), ReconError> {
    let tx_ids: Vec<Uuid> = transactions.iter().map(|t| t.transaction_id).collect();
    let inv_ids: Vec<Uuid> = invoices.iter().map(|i| i.invoice_id).collect();
    let tx_allocated = unit.allocated_to_transactions(tenant_id, &tx_ids).await?;
    let inv_allocated = unit.allocated_to_invoices(tenant_id, &inv_ids).await?;

    for t in transactions {
        let status = ReconciliationStatus::derive(
            allocated_of(&tx_allocated, t.transaction_id),
            t.magnitude(),
        );
        if status != t.status {
            unit.set_transaction_status(tenant_id, t.transaction_id, status)
                .await?;
        }
    }
    for i in invoices {
        let status = ReconciliationStatus::derive(allocated_of(&inv_allocated, i.invoice_id), i.total);
        if status != i.status {
            unit.set_invoice_status(tenant_id, i.invoice_id, status).await?;
        }
    }
    Ok(())
}
