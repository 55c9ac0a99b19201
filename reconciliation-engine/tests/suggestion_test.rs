//! Integration tests for suggestion generation.

mod common;

use chrono::NaiveDate;
use common::{date, july, spawn_app, window};
use reconciliation_engine::matching::SimilarityScorer;
use reconciliation_engine::models::{AccountKind, DateWindow, ReconciliationStatus, SplitKind};
use reconciliation_engine::{EntityStore, ReconError};

#[tokio::test]
async fn exact_match_yields_one_to_one() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -100_000, date(2024, 7, 10), "Papeleria El Sol")
        .await;
    let inv = app
        .invoice(100_000, date(2024, 7, 10), "Papelería El Sol, S.A. de C.V.")
        .await;

    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();

    assert_eq!(suggestions.len(), 1);
    let s = &suggestions[0];
    assert_eq!(s.kind, SplitKind::OneToOne);
    assert!(s.score >= 0.95, "score was {}", s.score);
    assert_eq!(s.transaction_refs, vec![tx.transaction_id]);
    assert_eq!(s.invoice_refs, vec![inv.invoice_id]);
    assert_eq!(s.allocations[0].amount, 100_000);
}

#[tokio::test]
async fn amount_mismatch_is_excluded() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -50_000, date(2024, 7, 10), "Ferreteria Norte")
        .await;
    app.invoice(200_000, date(2024, 7, 10), "Ferreteria Norte").await;

    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();
    assert!(suggestions.is_empty());
}

#[tokio::test]
async fn empty_batch_is_not_an_error() {
    let app = spawn_app();
    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();
    assert!(suggestions.is_empty());
}

#[tokio::test]
async fn one_transfer_split_across_invoices() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -180_000, date(2024, 7, 20), "SPEI Logistica Maya")
        .await;
    let first = app.invoice(120_000, date(2024, 7, 5), "Logistica Maya").await;
    let second = app.invoice(60_000, date(2024, 7, 12), "Logistica Maya").await;

    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();
    let split = suggestions
        .iter()
        .find(|s| s.kind == SplitKind::OneToMany)
        .expect("one-to-many suggestion");

    assert_eq!(split.transaction_refs, vec![tx.transaction_id]);
    assert!(split.invoice_refs.contains(&first.invoice_id));
    assert!(split.invoice_refs.contains(&second.invoice_id));
    assert_eq!(split.allocations.iter().map(|a| a.amount).sum::<i64>(), 180_000);
}

#[tokio::test]
async fn invoice_issued_before_window_is_still_considered() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -75_000, date(2024, 7, 2), "Grupo Textil Lerma")
        .await;
    let inv = app.invoice(75_000, date(2024, 6, 28), "Grupo Textil Lerma").await;

    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].invoice_refs, vec![inv.invoice_id]);
}

#[tokio::test]
async fn other_tenant_rows_never_appear() {
    let app = spawn_app();
    let other = app.other_tenant();

    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -100_000, date(2024, 7, 10), "Acme").await;
    other.invoice(100_000, date(2024, 7, 10), "Acme").await;

    assert!(app
        .service
        .suggestions(app.tenant_id, july())
        .await
        .unwrap()
        .is_empty());
    assert!(other
        .service
        .suggestions(other.tenant_id, july())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn partially_allocated_rows_match_on_remainder() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -100_000, date(2024, 7, 10), "Servicios Delta")
        .await;
    let inv = app.invoice(100_000, date(2024, 7, 10), "Servicios Delta").await;

    let mut partial = app.service.suggestions(app.tenant_id, july()).await.unwrap()[0].clone();
    partial.allocations[0].amount = 40_000;
    app.service
        .apply(app.tenant_id, &partial, "tester")
        .await
        .unwrap();

    let invoice = app.store.get_invoice(app.tenant_id, inv.invoice_id).await.unwrap();
    assert_eq!(invoice.status, ReconciliationStatus::PartiallyReconciled);

    let late = app
        .transaction(&account, -60_000, date(2024, 7, 12), "Servicios Delta")
        .await;
    let suggestions = app.service.suggestions(app.tenant_id, july()).await.unwrap();
    let remainder = suggestions
        .iter()
        .find(|s| s.transaction_refs == vec![late.transaction_id])
        .expect("remainder suggestion");
    assert_eq!(remainder.invoice_refs, vec![inv.invoice_id]);
    assert_eq!(remainder.allocations[0].amount, 60_000);
}

#[tokio::test]
async fn reversed_window_is_rejected() {
    let app = spawn_app();
    let reversed = DateWindow {
        start: date(2024, 7, 31),
        end: date(2024, 7, 1),
    };
    let err = app
        .service
        .suggestions(app.tenant_id, reversed)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::InvalidWindow { .. }));
}

#[tokio::test]
async fn scoring_is_deterministic() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -99_500, date(2024, 7, 10), "Cafe Tacuba 8831")
        .await;
    let inv = app.invoice(100_000, date(2024, 7, 8), "Café Tacuba").await;

    let scorer = SimilarityScorer::new(0.02, 7);
    let first = scorer.score(&tx, &inv);
    let second = scorer.score(&tx, &inv);
    assert_eq!(first.to_bits(), second.to_bits());
    assert!(first > 0.0);

    let suggestions = app
        .service
        .suggestions(app.tenant_id, window(date(2024, 7, 1), date(2024, 7, 15)))
        .await
        .unwrap();
    let again = app
        .service
        .suggestions(app.tenant_id, window(date(2024, 7, 1), date(2024, 7, 15)))
        .await
        .unwrap();
    assert_eq!(suggestions, again);
}

#[tokio::test]
async fn windows_at_the_calendar_edges_return_nothing() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -100_000, date(2024, 7, 10), "Acme")
        .await;
    app.invoice(100_000, date(2024, 7, 10), "Acme").await;

    let late = app
        .service
        .suggestions(app.tenant_id, window(NaiveDate::MAX, NaiveDate::MAX))
        .await
        .unwrap();
    assert!(late.is_empty());

    let early = app
        .service
        .suggestions(app.tenant_id, window(NaiveDate::MIN, NaiveDate::MIN))
        .await
        .unwrap();
    assert!(early.is_empty());
}
