//! Integration tests for installment-plan (MSI) detection and promotion.

mod common;

use chrono::NaiveDate;
use common::{date, spawn_app, window};
use reconciliation_engine::error::ConflictInvariant;
use reconciliation_engine::models::{
    AccountKind, DateWindow, MsiStatus, ReconciliationStatus, SplitKind,
};
use reconciliation_engine::{EntityStore, ReconError};
use uuid::Uuid;

fn february() -> DateWindow {
    window(date(2024, 2, 1), date(2024, 2, 29))
}

#[tokio::test]
async fn six_month_plan_is_detected_and_persisted() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    let tx = app
        .transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    let inv = app
        .card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;

    let detected = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap();

    assert_eq!(detected.len(), 1);
    let candidate = &detected[0];
    assert_eq!(candidate.transaction_id, tx.transaction_id);
    assert_eq!(candidate.invoice_id, inv.invoice_id);
    assert_eq!(candidate.plan_length, 6);
    assert_eq!(candidate.per_period_amount, 100_000);
    assert!(candidate.confidence >= 0.8);

    let pending = app
        .service
        .installment_candidates(app.tenant_id, Some(MsiStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].candidate_id, candidate.candidate_id);
}

#[tokio::test]
async fn non_credit_account_yields_no_candidates() {
    let app = spawn_app();
    let debit = app.account(AccountKind::DebitCard).await;
    app.transaction(&debit, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    app.card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;

    let detected = app
        .service
        .detect_installments(app.tenant_id, debit.account_id, february())
        .await
        .unwrap();
    assert!(detected.is_empty());
}

#[tokio::test]
async fn repeated_detection_does_not_duplicate_pending_pairs() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    app.transaction(&card, -50_000, date(2024, 2, 10), "AMAZON MSI")
        .await;
    app.card_invoice(150_000, date(2024, 1, 25), "Amazon Mexico").await;

    let first = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap();
    let second = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(
        app.service
            .installment_candidates(app.tenant_id, None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn accepting_a_candidate_allocates_one_period() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    let tx = app
        .transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    let inv = app
        .card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;
    let candidate = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap()
        .remove(0);

    let group = app
        .service
        .accept_installment(app.tenant_id, candidate.candidate_id, "reviewer")
        .await
        .unwrap();

    assert_eq!(group.kind, SplitKind::OneToOne);
    assert_eq!(group.splits.len(), 1);
    assert_eq!(group.splits[0].allocated_amount, 100_000);

    let tx = app
        .store
        .get_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap();
    let inv = app
        .store
        .get_invoice(app.tenant_id, inv.invoice_id)
        .await
        .unwrap();
    assert_eq!(tx.status, ReconciliationStatus::Reconciled);
    assert_eq!(inv.status, ReconciliationStatus::PartiallyReconciled);

    let accepted = app
        .store
        .get_msi_candidate(app.tenant_id, candidate.candidate_id)
        .await
        .unwrap();
    assert_eq!(accepted.status, MsiStatus::Accepted);
}

#[tokio::test]
async fn later_periods_match_a_partially_paid_invoice() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    app.transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    let inv = app
        .card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;
    let first = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap()
        .remove(0);
    app.service
        .accept_installment(app.tenant_id, first.candidate_id, "reviewer")
        .await
        .unwrap();

    let march_tx = app
        .transaction(&card, -100_000, date(2024, 3, 10), "LIVERPOOL 02/06")
        .await;
    let march = app
        .service
        .detect_installments(
            app.tenant_id,
            card.account_id,
            window(date(2024, 3, 1), date(2024, 3, 31)),
        )
        .await
        .unwrap();

    assert_eq!(march.len(), 1);
    assert_eq!(march[0].transaction_id, march_tx.transaction_id);
    assert_eq!(march[0].invoice_id, inv.invoice_id);
}

#[tokio::test]
async fn discarded_candidate_cannot_be_accepted() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    app.transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    app.card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;
    let candidate = app
        .service
        .detect_installments(app.tenant_id, card.account_id, february())
        .await
        .unwrap()
        .remove(0);

    let discarded = app
        .service
        .discard_installment(app.tenant_id, candidate.candidate_id)
        .await
        .unwrap();
    assert_eq!(discarded.status, MsiStatus::Discarded);

    let err = app
        .service
        .accept_installment(app.tenant_id, candidate.candidate_id, "reviewer")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconError::ReconciliationConflict {
            invariant: ConflictInvariant::CandidateNotPending,
            ..
        }
    ));
    assert!(app
        .service
        .split_groups(app.tenant_id, true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unknown_and_foreign_accounts_are_distinguished() {
    let app = spawn_app();
    let other = app.other_tenant();
    let foreign = other.account(AccountKind::CreditCard).await;

    let missing = app
        .service
        .detect_installments(app.tenant_id, Uuid::new_v4(), february())
        .await
        .unwrap_err();
    assert!(matches!(missing, ReconError::NotFound { .. }));

    let scoped = app
        .service
        .detect_installments(app.tenant_id, foreign.account_id, february())
        .await
        .unwrap_err();
    assert!(matches!(scoped, ReconError::InvalidScope { .. }));
}

#[tokio::test]
async fn foreign_candidate_cannot_be_accepted() {
    let app = spawn_app();
    let other = app.other_tenant();
    let card = other.account(AccountKind::CreditCard).await;
    other
        .transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;
    other
        .card_invoice(600_000, date(2024, 1, 20), "Distribuidora Liverpool")
        .await;
    let candidate = other
        .service
        .detect_installments(other.tenant_id, card.account_id, february())
        .await
        .unwrap()
        .remove(0);

    let err = app
        .service
        .accept_installment(app.tenant_id, candidate.candidate_id, "intruder")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::InvalidScope { .. }));

    let still_pending = other
        .store
        .get_msi_candidate(other.tenant_id, candidate.candidate_id)
        .await
        .unwrap();
    assert_eq!(still_pending.status, MsiStatus::Pending);
}

#[tokio::test]
async fn lookback_before_the_calendar_start_is_clamped() {
    let app = spawn_app();
    let card = app.account(AccountKind::CreditCard).await;
    app.transaction(&card, -100_000, date(2024, 2, 10), "LIVERPOOL 01/06")
        .await;

    let detected = app
        .service
        .detect_installments(
            app.tenant_id,
            card.account_id,
            window(NaiveDate::MIN, NaiveDate::MIN),
        )
        .await
        .unwrap();
    assert!(detected.is_empty());
}
