//! Error taxonomy for reconciliation-engine.

use crate::models::{EntityKind, EntityRef};
use chrono::NaiveDate;
use service_core::error::AppError;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Which invariant an apply/undo (or store mutation) would have broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictInvariant {
    /// Allocations against a transaction would exceed its amount.
    TransactionOverflow,
    /// Allocations against an invoice would exceed its total.
    InvoiceOverflow,
    /// A split suggestion's allocations do not add up to the funding side.
    AllocationSumMismatch,
    /// The suggestion's shape contradicts its kind or references.
    MalformedSuggestion,
    /// Account kind cannot change once transactions exist against it.
    AccountKindLocked,
    /// A row referenced by the split ledger cannot be deleted.
    ReferencedBySplit,
    /// An installment candidate was already accepted or discarded.
    CandidateNotPending,
}

impl ConflictInvariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionOverflow => "transaction_overflow",
            Self::InvoiceOverflow => "invoice_overflow",
            Self::AllocationSumMismatch => "allocation_sum_mismatch",
            Self::MalformedSuggestion => "malformed_suggestion",
            Self::AccountKindLocked => "account_kind_locked",
            Self::ReferencedBySplit => "referenced_by_split",
            Self::CandidateNotPending => "candidate_not_pending",
        }
    }
}

impl fmt::Display for ConflictInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Invalid scope: {detail}")]
    InvalidScope { detail: String },

    #[error("Invalid window: end {end} precedes start {start}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("Reconciliation conflict on {entity} ({invariant}): {detail}")]
    ReconciliationConflict {
        entity: EntityRef,
        invariant: ConflictInvariant,
        detail: String,
    },

    #[error("Not found: {entity}")]
    NotFound { entity: EntityRef },

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl ReconError {
    pub fn conflict(
        entity: EntityRef,
        invariant: ConflictInvariant,
        detail: impl Into<String>,
    ) -> Self {
        Self::ReconciliationConflict {
            entity,
            invariant,
            detail: detail.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        Self::NotFound {
            entity: EntityRef { kind, id },
        }
    }

    pub fn scope(detail: impl Into<String>) -> Self {
        Self::InvalidScope {
            detail: detail.into(),
        }
    }

    /// Wrap a storage-layer failure with the operation that hit it.
    pub fn database(operation: &str, err: impl fmt::Display) -> Self {
        Self::Storage(AppError::DatabaseError(anyhow::anyhow!(
            "Failed to {}: {}",
            operation,
            err
        )))
    }

    /// Label used for the error counter.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidScope { .. } => "invalid_scope",
            Self::InvalidWindow { .. } => "invalid_window",
            Self::ReconciliationConflict { .. } => "reconciliation_conflict",
            Self::NotFound { .. } => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<ReconError> for AppError {
    fn from(err: ReconError) -> Self {
        match err {
            ReconError::InvalidScope { .. } => AppError::Forbidden(anyhow::anyhow!(err.to_string())),
            ReconError::InvalidWindow { .. } => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            ReconError::ReconciliationConflict { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            ReconError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            ReconError::Storage(inner) => inner,
        }
    }
}
