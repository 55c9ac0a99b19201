//! Integration tests for the in-memory entity store.

mod common;

use chrono::Utc;
use common::{date, july, spawn_app};
use reconciliation_engine::error::ConflictInvariant;
use reconciliation_engine::models::{
    AccountKind, Allocation, EntityKind, NewBankTransaction, ReconciliationSplit,
    ReconciliationStatus, SplitKind, Suggestion,
};
use reconciliation_engine::{EntityStore, ReconError};
use uuid::Uuid;

#[tokio::test]
async fn transaction_inherits_account_currency() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -12_345, date(2024, 7, 2), "SPEI")
        .await;

    assert_eq!(tx.currency, "MXN");
    assert_eq!(tx.status, ReconciliationStatus::Unreconciled);
    assert_eq!(tx.magnitude(), 12_345);
}

#[tokio::test]
async fn transaction_on_unknown_or_foreign_account_is_rejected() {
    let app = spawn_app();
    let other = app.other_tenant();
    let foreign = other.account(AccountKind::Checking).await;

    let new_tx = |account_id| NewBankTransaction {
        tenant_id: app.tenant_id,
        account_id,
        amount: -500,
        posted_date: date(2024, 7, 2),
        description: "x".to_string(),
        running_balance: None,
    };

    let err = app
        .store
        .insert_transaction(&new_tx(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::NotFound { entity } if entity.kind == EntityKind::Account));

    let err = app
        .store
        .insert_transaction(&new_tx(foreign.account_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::InvalidScope { .. }));
}

#[tokio::test]
async fn account_kind_locks_once_used() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;

    let changed = app
        .store
        .update_account_kind(app.tenant_id, account.account_id, AccountKind::CreditCard)
        .await
        .unwrap();
    assert_eq!(changed.kind, AccountKind::CreditCard);

    app.transaction(&changed, -100, date(2024, 7, 2), "Cargo")
        .await;

    let err = app
        .store
        .update_account_kind(app.tenant_id, account.account_id, AccountKind::Checking)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconError::ReconciliationConflict {
            invariant: ConflictInvariant::AccountKindLocked,
            ..
        }
    ));
}

#[tokio::test]
async fn referenced_transaction_cannot_be_deleted() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -1_000, date(2024, 7, 2), "Acme")
        .await;
    let inv = app.invoice(1_000, date(2024, 7, 2), "Acme").await;

    let group = app
        .service
        .apply(
            app.tenant_id,
            &Suggestion {
                kind: SplitKind::OneToOne,
                score: 1.0,
                transaction_refs: vec![tx.transaction_id],
                invoice_refs: vec![inv.invoice_id],
                allocations: vec![Allocation {
                    transaction_id: tx.transaction_id,
                    invoice_id: inv.invoice_id,
                    amount: 1_000,
                }],
                anchor_date: date(2024, 7, 2),
            },
            "tester",
        )
        .await
        .unwrap();

    let refused = |err: ReconError| {
        matches!(
            err,
            ReconError::ReconciliationConflict {
                invariant: ConflictInvariant::ReferencedBySplit,
                ..
            }
        )
    };

    let err = app
        .store
        .delete_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap_err();
    assert!(refused(err));

    // The reversed split is still history that points at the row.
    app.service
        .undo(app.tenant_id, group.split_group_id)
        .await
        .unwrap();
    let err = app
        .store
        .delete_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap_err();
    assert!(refused(err));
}

#[tokio::test]
async fn unreferenced_transaction_is_deleted() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -1_000, date(2024, 7, 2), "Acme")
        .await;

    app.store
        .delete_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap();

    let err = app
        .store
        .get_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::NotFound { .. }));
}

#[tokio::test]
async fn getters_never_cross_tenants() {
    let app = spawn_app();
    let other = app.other_tenant();
    let account = other.account(AccountKind::Checking).await;
    let tx = other
        .transaction(&account, -1_000, date(2024, 7, 2), "Acme")
        .await;
    let inv = other.invoice(1_000, date(2024, 7, 2), "Acme").await;

    assert!(matches!(
        app.store
            .get_account(app.tenant_id, account.account_id)
            .await,
        Err(ReconError::InvalidScope { .. })
    ));
    assert!(matches!(
        app.store
            .get_transaction(app.tenant_id, tx.transaction_id)
            .await,
        Err(ReconError::InvalidScope { .. })
    ));
    assert!(matches!(
        app.store.get_invoice(app.tenant_id, inv.invoice_id).await,
        Err(ReconError::InvalidScope { .. })
    ));
    assert!(matches!(
        app.store
            .delete_transaction(app.tenant_id, tx.transaction_id)
            .await,
        Err(ReconError::InvalidScope { .. })
    ));

    assert!(app
        .store
        .open_transactions(app.tenant_id, july(), None)
        .await
        .unwrap()
        .is_empty());
    assert!(app
        .store
        .open_invoices(app.tenant_id, july())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn summary_counts_rows_in_window() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    app.transaction(&account, -1_000, date(2024, 7, 2), "A")
        .await;
    app.transaction(&account, 2_500, date(2024, 7, 20), "B")
        .await;
    app.transaction(&account, -9_999, date(2024, 8, 1), "Outside")
        .await;
    app.invoice(4_000, date(2024, 7, 5), "C").await;

    let summary = app.service.summary(app.tenant_id, july()).await.unwrap();

    assert_eq!(summary.tenant_id, app.tenant_id);
    assert_eq!(summary.transactions.unreconciled_count, 2);
    assert_eq!(summary.transactions.unreconciled_amount, 3_500);
    assert_eq!(summary.transactions.total_count(), 2);
    assert_eq!(summary.transactions.allocated_amount, 0);
    assert_eq!(summary.invoices.unreconciled_count, 1);
    assert_eq!(summary.invoices.unreconciled_amount, 4_000);
}

#[tokio::test]
async fn dropped_unit_of_work_discards_writes() {
    let app = spawn_app();
    let account = app.account(AccountKind::Checking).await;
    let tx = app
        .transaction(&account, -1_000, date(2024, 7, 2), "Acme")
        .await;
    let inv = app.invoice(1_000, date(2024, 7, 2), "Acme").await;

    {
        let mut work = app.store.begin().await.unwrap();
        let locked = work
            .lock_transactions(app.tenant_id, &[tx.transaction_id])
            .await
            .unwrap();
        assert_eq!(locked.len(), 1);
        work.insert_splits(&[ReconciliationSplit {
            split_id: Uuid::new_v4(),
            split_group_id: Uuid::new_v4(),
            tenant_id: app.tenant_id,
            transaction_id: tx.transaction_id,
            invoice_id: inv.invoice_id,
            allocated_amount: 1_000,
            kind: SplitKind::OneToOne,
            created_by: "tester".to_string(),
            created_utc: Utc::now(),
            reversed_utc: None,
        }])
        .await
        .unwrap();

        let staged = work
            .allocated_to_transactions(app.tenant_id, &[tx.transaction_id])
            .await
            .unwrap();
        assert_eq!(staged.get(&tx.transaction_id).copied(), Some(1_000));
        work.set_transaction_status(
            app.tenant_id,
            tx.transaction_id,
            ReconciliationStatus::Reconciled,
        )
        .await
        .unwrap();
    }

    let fetched = app
        .store
        .get_transaction(app.tenant_id, tx.transaction_id)
        .await
        .unwrap();
    assert_eq!(fetched.status, ReconciliationStatus::Unreconciled);
    assert!(app
        .store
        .list_split_groups(app.tenant_id, true)
        .await
        .unwrap()
        .is_empty());

    // Row locks were released with the dropped unit.
    let mut work = app.store.begin().await.unwrap();
    work.lock_transactions(app.tenant_id, &[tx.transaction_id])
        .await
        .unwrap();
    work.commit().await.unwrap();
}
