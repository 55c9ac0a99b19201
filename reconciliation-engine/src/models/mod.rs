//! Domain models for reconciliation-engine.

#![allow(clippy::should_implement_trait)]

use crate::error::ReconError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Entity References
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Transaction,
    Invoice,
    SplitGroup,
    MsiCandidate,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Transaction => "transaction",
            Self::Invoice => "invoice",
            Self::SplitGroup => "split_group",
            Self::MsiCandidate => "msi_candidate",
        }
    }
}

/// Identifies one row of the entity store in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn account(id: Uuid) -> Self {
        Self { kind: EntityKind::Account, id }
    }

    pub fn transaction(id: Uuid) -> Self {
        Self { kind: EntityKind::Transaction, id }
    }

    pub fn invoice(id: Uuid) -> Self {
        Self { kind: EntityKind::Invoice, id }
    }

    pub fn split_group(id: Uuid) -> Self {
        Self { kind: EntityKind::SplitGroup, id }
    }

    pub fn msi_candidate(id: Uuid) -> Self {
        Self { kind: EntityKind::MsiCandidate, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.id)
    }
}

// ============================================================================
// Date Windows
// ============================================================================

/// Inclusive date range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ReconError> {
        if end < start {
            return Err(ReconError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Re-check a window that may have been built field by field (e.g. deserialized).
    pub fn validate(&self) -> Result<(), ReconError> {
        Self::new(self.start, self.end).map(|_| ())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Extend the window by `before` and `after`, saturating at the calendar limits.
    pub fn widen(&self, before: Duration, after: Duration) -> Self {
        Self {
            start: self
                .start
                .checked_sub_signed(before)
                .unwrap_or(NaiveDate::MIN),
            end: self.end.checked_add_signed(after).unwrap_or(NaiveDate::MAX),
        }
    }

    /// Number of days between start and end.
    pub fn length_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

// ============================================================================
// Account Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    CreditCard,
    DebitCard,
    Checking,
    Savings,
    Cash,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditCard => "credit_card",
            Self::DebitCard => "debit_card",
            Self::Checking => "checking",
            Self::Savings => "savings",
            Self::Cash => "cash",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "credit_card" => Self::CreditCard,
            "debit_card" => Self::DebitCard,
            "checking" => Self::Checking,
            "savings" => Self::Savings,
            "cash" => Self::Cash,
            _ => Self::Checking,
        }
    }

    /// Only credit-card statements carry deferred installment charges.
    pub fn is_installment_eligible(&self) -> bool {
        matches!(self, Self::CreditCard)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: AccountKind,
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub tenant_id: Uuid,
    pub kind: AccountKind,
    pub currency: String,
}

// ============================================================================
// Reconciliation Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Unreconciled,
    PartiallyReconciled,
    Reconciled,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreconciled => "unreconciled",
            Self::PartiallyReconciled => "partially_reconciled",
            Self::Reconciled => "reconciled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "unreconciled" => Self::Unreconciled,
            "partially_reconciled" => Self::PartiallyReconciled,
            "reconciled" => Self::Reconciled,
            _ => Self::Unreconciled,
        }
    }

    /// Status projected from the allocated total of non-reversed splits.
    pub fn derive(allocated: i64, amount: i64) -> Self {
        if allocated <= 0 {
            Self::Unreconciled
        } else if allocated >= amount {
            Self::Reconciled
        } else {
            Self::PartiallyReconciled
        }
    }
}

// ============================================================================
// Bank Transaction Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    /// Signed minor units; card charges are usually negative.
    pub amount: i64,
    pub currency: String,
    pub posted_date: NaiveDate,
    pub description: String,
    pub running_balance: Option<i64>,
    pub status: ReconciliationStatus,
    pub created_utc: DateTime<Utc>,
}

impl BankTransaction {
    /// Unsigned amount available for allocation.
    pub fn magnitude(&self) -> i64 {
        self.amount.saturating_abs()
    }
}

/// Normalized statement line handed over by statement ingestion.
#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub posted_date: NaiveDate,
    pub description: String,
    pub running_balance: Option<i64>,
}

// ============================================================================
// Invoice Models
// ============================================================================

/// SAT c_MetodoPago.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// `PUE`: paid in a single exhibition.
    SinglePayment,
    /// `PPD`: paid in installments or deferred.
    Deferred,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SinglePayment => "PUE",
            Self::Deferred => "PPD",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PPD" => Self::Deferred,
            _ => Self::SinglePayment,
        }
    }
}

/// c_FormaPago codes that can settle through a card statement.
const CARD_PAYMENT_FORMS: [&str; 3] = ["04", "28", "99"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub account_id: Option<Uuid>,
    pub counterparty_tax_id: String,
    pub counterparty_name: String,
    /// Minor units.
    pub total: i64,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub payment_method: PaymentMethod,
    /// SAT c_FormaPago, when the CFDI declares one.
    pub payment_form: Option<String>,
    pub status: ReconciliationStatus,
    pub created_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn is_card_payable(&self) -> bool {
        match &self.payment_form {
            Some(form) => CARD_PAYMENT_FORMS.contains(&form.trim()),
            None => true,
        }
    }
}

/// Normalized CFDI handed over by invoice ingestion.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: Uuid,
    pub account_id: Option<Uuid>,
    pub counterparty_tax_id: String,
    pub counterparty_name: String,
    pub total: i64,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub payment_method: PaymentMethod,
    pub payment_form: Option<String>,
}

/// A row that is not yet fully reconciled, with what is already allocated to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Open<T> {
    pub item: T,
    pub allocated: i64,
}

impl Open<BankTransaction> {
    pub fn remaining(&self) -> i64 {
        (self.item.magnitude() - self.allocated).max(0)
    }
}

impl Open<Invoice> {
    pub fn remaining(&self) -> i64 {
        (self.item.total - self.allocated).max(0)
    }
}

// ============================================================================
// Split Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    OneToOne,
    OneToMany,
    ManyToOne,
}

impl SplitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::OneToMany => "one_to_many",
            Self::ManyToOne => "many_to_one",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "one_to_many" => Self::OneToMany,
            "many_to_one" => Self::ManyToOne,
            _ => Self::OneToOne,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSplit {
    pub split_id: Uuid,
    pub split_group_id: Uuid,
    pub tenant_id: Uuid,
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub allocated_amount: i64,
    pub kind: SplitKind,
    pub created_by: String,
    pub created_utc: DateTime<Utc>,
    pub reversed_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitGroup {
    pub split_group_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: SplitKind,
    pub splits: Vec<ReconciliationSplit>,
    pub created_by: String,
    pub created_utc: DateTime<Utc>,
    pub reversed_utc: Option<DateTime<Utc>>,
}

impl SplitGroup {
    /// Assemble a group from its split rows. Returns `None` for an empty slice.
    pub fn from_splits(splits: Vec<ReconciliationSplit>) -> Option<Self> {
        let first = splits.first()?.clone();
        let reversed_utc = splits.iter().filter_map(|s| s.reversed_utc).max();
        Some(Self {
            split_group_id: first.split_group_id,
            tenant_id: first.tenant_id,
            kind: first.kind,
            created_by: first.created_by,
            created_utc: first.created_utc,
            reversed_utc,
            splits,
        })
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed_utc.is_some()
    }

    pub fn total_allocated(&self) -> i64 {
        self.splits.iter().map(|s| s.allocated_amount).sum()
    }
}

// ============================================================================
// Suggestion Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: i64,
}

/// A proposed match; nothing is persisted until it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SplitKind,
    pub score: f64,
    pub transaction_refs: Vec<Uuid>,
    pub invoice_refs: Vec<Uuid>,
    pub allocations: Vec<Allocation>,
    /// Earliest posted/issue date among the entities involved.
    pub anchor_date: NaiveDate,
}

impl Suggestion {
    pub fn entity_count(&self) -> usize {
        self.transaction_refs.len() + self.invoice_refs.len()
    }
}

// ============================================================================
// Installment (MSI) Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsiStatus {
    Pending,
    Accepted,
    Discarded,
}

impl MsiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Discarded => "discarded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "discarded" => Self::Discarded,
            _ => Self::Pending,
        }
    }
}

/// The plan length that also fit, kept for human review only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MsiDiagnostics {
    pub runner_up_plan_length: u32,
    pub runner_up_relative_error: f64,
}

pub const MSI_SOURCE_AMOUNT_RATIO: &str = "amount_ratio";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsiCandidate {
    pub candidate_id: Uuid,
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub plan_length: u32,
    pub per_period_amount: i64,
    /// `total % plan_length`, never redistributed across periods.
    pub remainder: i64,
    pub confidence: f64,
    pub source: String,
    pub diagnostics: Option<MsiDiagnostics>,
    pub status: MsiStatus,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Summary Models
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTotals {
    pub reconciled_count: i64,
    pub reconciled_amount: i64,
    pub partially_reconciled_count: i64,
    pub partially_reconciled_amount: i64,
    pub unreconciled_count: i64,
    pub unreconciled_amount: i64,
    /// Sum of non-reversed split allocations against these rows.
    pub allocated_amount: i64,
}

impl StatusTotals {
    pub fn record(&mut self, status: ReconciliationStatus, amount: i64, allocated: i64) {
        match status {
            ReconciliationStatus::Reconciled => {
                self.reconciled_count += 1;
                self.reconciled_amount += amount;
            }
            ReconciliationStatus::PartiallyReconciled => {
                self.partially_reconciled_count += 1;
                self.partially_reconciled_amount += amount;
            }
            ReconciliationStatus::Unreconciled => {
                self.unreconciled_count += 1;
                self.unreconciled_amount += amount;
            }
        }
        self.allocated_amount += allocated;
    }

    pub fn total_count(&self) -> i64 {
        self.reconciled_count + self.partially_reconciled_count + self.unreconciled_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub tenant_id: Uuid,
    pub window: DateWindow,
    pub transactions: StatusTotals,
    pub invoices: StatusTotals,
}
