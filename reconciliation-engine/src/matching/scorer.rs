//! Match-confidence scoring between bank transactions and invoices.

use super::text::token_overlap;
use crate::config::MatchingConfig;
use crate::models::{BankTransaction, Invoice};
use chrono::NaiveDate;
use serde::Serialize;

const AMOUNT_WEIGHT: f64 = 0.5;
const DATE_WEIGHT: f64 = 0.3;
const TEXT_WEIGHT: f64 = 0.2;

/// The three sub-scores and their weighted combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub amount: f64,
    pub date: f64,
    pub text: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn new(amount: f64, date: f64, text: f64) -> Self {
        Self {
            amount,
            date,
            text,
            total: combine(amount, date, text),
        }
    }
}

/// `1 - |delta| / expected`, or 0 once the relative delta exceeds `tolerance`.
pub fn amount_score(observed: i64, expected: i64, tolerance: f64) -> f64 {
    if observed <= 0 || expected <= 0 {
        return 0.0;
    }
    let relative = relative_error(observed, expected);
    if relative > tolerance {
        0.0
    } else {
        1.0 - relative.min(1.0)
    }
}

pub fn relative_error(observed: i64, expected: i64) -> f64 {
    (observed - expected).abs() as f64 / expected as f64
}

/// Linear decay from 1.0 at zero days apart to 0.0 at `window_days`.
pub fn date_score(a: NaiveDate, b: NaiveDate, window_days: u32) -> f64 {
    let apart = (a - b).num_days().unsigned_abs() as f64;
    if window_days == 0 {
        return if apart == 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - apart / f64::from(window_days)).max(0.0)
}

/// Weighted sum; an amount score of zero disqualifies the pair outright.
pub fn combine(amount: f64, date: f64, text: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    (AMOUNT_WEIGHT * amount + DATE_WEIGHT * date + TEXT_WEIGHT * text).clamp(0.0, 1.0)
}

/// Pure, deterministic scorer. Holds only the tolerance and window it scores with.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityScorer {
    amount_tolerance: f64,
    date_window_days: u32,
}

impl SimilarityScorer {
    pub fn new(amount_tolerance: f64, date_window_days: u32) -> Self {
        Self {
            amount_tolerance,
            date_window_days,
        }
    }

    /// Scorer for direct one-to-one matches.
    pub fn direct(config: &MatchingConfig) -> Self {
        Self::new(config.amount_tolerance, config.direct_date_window_days)
    }

    /// Scorer for split candidates, which tolerate a wider date spread.
    pub fn split(config: &MatchingConfig) -> Self {
        Self::new(config.amount_tolerance, config.split_date_window_days)
    }

    pub fn amount_tolerance(&self) -> f64 {
        self.amount_tolerance
    }

    pub fn date_window_days(&self) -> u32 {
        self.date_window_days
    }

    /// Score in `[0, 1]` for one transaction against one invoice at their full amounts.
    pub fn score(&self, transaction: &BankTransaction, invoice: &Invoice) -> f64 {
        self.breakdown(transaction, invoice).total
    }

    pub fn breakdown(&self, transaction: &BankTransaction, invoice: &Invoice) -> ScoreBreakdown {
        if transaction.currency != invoice.currency {
            return ScoreBreakdown::new(0.0, 0.0, 0.0);
        }
        self.breakdown_amounts(
            transaction.magnitude(),
            invoice.total,
            transaction.posted_date,
            invoice.issue_date,
            &transaction.description,
            &invoice.counterparty_name,
        )
    }

    /// Same scoring over explicit amounts, used when only the unallocated
    /// remainder of a partially reconciled row is in play.
    pub fn breakdown_amounts(
        &self,
        transaction_amount: i64,
        invoice_amount: i64,
        posted_date: NaiveDate,
        issue_date: NaiveDate,
        description: &str,
        counterparty: &str,
    ) -> ScoreBreakdown {
        let amount = amount_score(transaction_amount, invoice_amount, self.amount_tolerance);
        let date = date_score(posted_date, issue_date, self.date_window_days);
        let text = token_overlap(description, counterparty);
        ScoreBreakdown::new(amount, date, text)
    }

    pub fn within_window(&self, a: NaiveDate, b: NaiveDate) -> bool {
        (a - b).num_days().unsigned_abs() <= u64::from(self.date_window_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, ReconciliationStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn txn(amount: i64, posted: NaiveDate, description: &str) -> BankTransaction {
        BankTransaction {
            transaction_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            account_id: Uuid::nil(),
            amount,
            currency: "MXN".into(),
            posted_date: posted,
            description: description.into(),
            running_balance: None,
            status: ReconciliationStatus::Unreconciled,
            created_utc: Utc::now(),
        }
    }

    fn invoice(total: i64, issued: NaiveDate, name: &str) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            account_id: None,
            counterparty_tax_id: "XAXX010101000".into(),
            counterparty_name: name.into(),
            total,
            currency: "MXN".into(),
            issue_date: issued,
            payment_method: PaymentMethod::SinglePayment,
            payment_form: Some("03".into()),
            status: ReconciliationStatus::Unreconciled,
            created_utc: Utc::now(),
        }
    }

    fn scorer() -> SimilarityScorer {
        SimilarityScorer::direct(&MatchingConfig::default())
    }

    #[test]
    fn exact_match_scores_near_one() {
        let t = txn(-100_000, day(10), "Office Depot de Mexico");
        let i = invoice(100_000, day(10), "Office Depot de Mexico");
        let score = scorer().score(&t, &i);
        assert!(score >= 0.95, "score was {score}");
    }

    #[test]
    fn amount_mismatch_forces_zero() {
        let t = txn(50_000, day(10), "Proveedora Norte");
        let i = invoice(200_000, day(10), "Proveedora Norte");
        let breakdown = scorer().breakdown(&t, &i);
        assert_eq!(breakdown.amount, 0.0);
        assert_eq!(breakdown.date, 1.0);
        assert_eq!(breakdown.text, 1.0);
        assert_eq!(breakdown.total, 0.0);
    }

    #[test]
    fn delta_just_inside_tolerance_is_kept() {
        // 1.5% off
        let score = amount_score(101_500, 100_000, 0.02);
        assert!((score - 0.985).abs() < 1e-9);
        assert_eq!(amount_score(102_500, 100_000, 0.02), 0.0);
    }

    #[test]
    fn date_score_decays_linearly() {
        assert_eq!(date_score(day(1), day(1), 7), 1.0);
        assert!((date_score(day(1), day(8), 7) - 0.0).abs() < 1e-12);
        assert!((date_score(day(10), day(3), 14) - 0.5).abs() < 1e-12);
        assert_eq!(date_score(day(1), day(20), 7), 0.0);
    }

    #[test]
    fn score_is_deterministic() {
        let t = txn(-99_000, day(12), "PAGO ACME LOGISTICA REF 44");
        let i = invoice(100_000, day(9), "Acme Logistica SA de CV");
        let s = scorer();
        let first = s.score(&t, &i);
        let second = s.score(&t, &i);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn cross_currency_never_scores() {
        let t = txn(100_000, day(10), "Acme");
        let mut i = invoice(100_000, day(10), "Acme");
        i.currency = "USD".into();
        assert_eq!(scorer().score(&t, &i), 0.0);
    }
}
