//! Installment-plan (MSI, "meses sin intereses") detection on credit-card accounts.

use crate::config::InstallmentConfig;
use crate::error::ReconError;
use crate::matching::scorer::{date_score, relative_error};
use crate::models::{
    Account, BankTransaction, DateWindow, Invoice, MsiCandidate, MsiDiagnostics, MsiStatus, Open,
    ReconciliationStatus, MSI_SOURCE_AMOUNT_RATIO,
};
use crate::store::EntityStore;
use chrono::{Duration, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

const AMOUNT_WEIGHT: f64 = 0.6;
const DATE_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PlanFit {
    plan_length: u32,
    per_period_amount: i64,
    remainder: i64,
    relative_error: f64,
}

#[derive(Debug, Clone)]
pub struct InstallmentDetector {
    config: InstallmentConfig,
}

impl InstallmentDetector {
    pub fn new(config: InstallmentConfig) -> Self {
        Self { config }
    }

    /// Load the account's open charges and the tenant's open invoices, then
    /// detect. Non-credit accounts yield an empty list. Nothing is persisted.
    #[instrument(skip(self, store), fields(tenant_id = %tenant_id, account_id = %account_id))]
    pub async fn detect(
        &self,
        store: &dyn EntityStore,
        tenant_id: Uuid,
        account_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        window.validate()?;
        let account = store.get_account(tenant_id, account_id).await?;
        if !account.kind.is_installment_eligible() {
            debug!(kind = account.kind.as_str(), "Account not installment eligible");
            return Ok(Vec::new());
        }

        let transactions = store
            .open_transactions(tenant_id, window, Some(account_id))
            .await?;
        let invoice_window = window.widen(
            Duration::days(i64::from(self.config.lookback_days)),
            Duration::zero(),
        );
        let invoices = store.open_invoices(tenant_id, invoice_window).await?;

        Ok(self.detect_candidates(&account, &transactions, &invoices))
    }

    /// Pure detection over already-loaded rows. At most one candidate per
    /// (transaction, invoice) pair.
    pub fn detect_candidates(
        &self,
        account: &Account,
        transactions: &[Open<BankTransaction>],
        invoices: &[Open<Invoice>],
    ) -> Vec<MsiCandidate> {
        if !account.kind.is_installment_eligible() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for tx in transactions {
            let charge = &tx.item;
            if charge.tenant_id != account.tenant_id
                || charge.account_id != account.account_id
                || charge.status != ReconciliationStatus::Unreconciled
                || charge.magnitude() == 0
            {
                continue;
            }

            for inv in invoices {
                let invoice = &inv.item;
                if !self.pair_eligible(charge, inv) {
                    continue;
                }
                let Some((best, runner_up)) = self.best_fit(charge.magnitude(), invoice.total)
                else {
                    continue;
                };

                let date = date_score(
                    charge.posted_date,
                    invoice.issue_date,
                    self.config.lookback_days,
                );
                let confidence = (AMOUNT_WEIGHT * (1.0 - best.relative_error)
                    + DATE_WEIGHT * date)
                    .clamp(0.0, 1.0);

                candidates.push(MsiCandidate {
                    candidate_id: Uuid::new_v4(),
                    tenant_id: account.tenant_id,
                    account_id: account.account_id,
                    transaction_id: charge.transaction_id,
                    invoice_id: invoice.invoice_id,
                    plan_length: best.plan_length,
                    per_period_amount: best.per_period_amount,
                    remainder: best.remainder,
                    confidence,
                    source: MSI_SOURCE_AMOUNT_RATIO.to_string(),
                    diagnostics: runner_up.map(|r| MsiDiagnostics {
                        runner_up_plan_length: r.plan_length,
                        runner_up_relative_error: r.relative_error,
                    }),
                    status: MsiStatus::Pending,
                    created_utc: Utc::now(),
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.transaction_id.cmp(&b.transaction_id))
                .then(a.invoice_id.cmp(&b.invoice_id))
        });
        candidates
    }

    /// Invoices stay eligible while partially reconciled: earlier periods of
    /// the same plan allocate against them.
    fn pair_eligible(&self, charge: &BankTransaction, inv: &Open<Invoice>) -> bool {
        let invoice = &inv.item;
        if invoice.tenant_id != charge.tenant_id
            || invoice.currency != charge.currency
            || invoice.status == ReconciliationStatus::Reconciled
            || invoice.total <= 0
            || inv.remaining() == 0
            || !invoice.is_card_payable()
        {
            return false;
        }
        let lead = (charge.posted_date - invoice.issue_date).num_days();
        lead >= 0 && lead <= i64::from(self.config.lookback_days)
    }

    /// Plan length with the smallest relative error inside tolerance, plus the
    /// next best one for diagnostics. Ties go to the shorter plan.
    fn best_fit(&self, charge: i64, total: i64) -> Option<(PlanFit, Option<PlanFit>)> {
        let mut fits: Vec<PlanFit> = self
            .config
            .plan_lengths
            .iter()
            .filter(|n| **n >= 2)
            .filter_map(|&n| {
                let per_period = total / i64::from(n);
                if per_period <= 0 {
                    return None;
                }
                let error = relative_error(charge, per_period);
                (error <= self.config.amount_tolerance).then_some(PlanFit {
                    plan_length: n,
                    per_period_amount: per_period,
                    remainder: total % i64::from(n),
                    relative_error: error,
                })
            })
            .collect();

        fits.sort_by(|a, b| {
            a.relative_error
                .total_cmp(&b.relative_error)
                .then(a.plan_length.cmp(&b.plan_length))
        });
        fits.dedup_by_key(|f| f.plan_length);

        let mut fits = fits.into_iter();
        let best = fits.next()?;
        Some((best, fits.next()))
    }
}
