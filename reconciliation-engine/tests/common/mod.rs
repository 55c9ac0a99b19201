//! Common test utilities for reconciliation-engine integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use reconciliation_engine::models::{
    Account, AccountKind, BankTransaction, DateWindow, Invoice, NewAccount, NewBankTransaction,
    NewInvoice, PaymentMethod,
};
use reconciliation_engine::{EngineConfig, EntityStore, InMemoryStore, ReconciliationService};
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_engine=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Engine wired to a fresh in-memory store, with a unique tenant.
pub struct TestApp {
    pub service: ReconciliationService,
    pub store: Arc<dyn EntityStore>,
    pub tenant_id: Uuid,
}

pub fn spawn_app() -> TestApp {
    init_tracing();
    let store: Arc<dyn EntityStore> = Arc::new(InMemoryStore::new());
    spawn_app_with(store)
}

pub fn spawn_app_with(store: Arc<dyn EntityStore>) -> TestApp {
    init_tracing();
    let service = ReconciliationService::new(Arc::clone(&store), &EngineConfig::default());
    TestApp {
        service,
        store,
        tenant_id: Uuid::new_v4(),
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn window(start: NaiveDate, end: NaiveDate) -> DateWindow {
    DateWindow::new(start, end).unwrap()
}

/// July 2024, the month most fixtures live in.
pub fn july() -> DateWindow {
    window(date(2024, 7, 1), date(2024, 7, 31))
}

impl TestApp {
    /// Same store and service, different tenant.
    pub fn other_tenant(&self) -> TestApp {
        TestApp {
            service: self.service.clone(),
            store: Arc::clone(&self.store),
            tenant_id: Uuid::new_v4(),
        }
    }

    pub async fn account(&self, kind: AccountKind) -> Account {
        self.store
            .insert_account(&NewAccount {
                tenant_id: self.tenant_id,
                kind,
                currency: "MXN".to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn transaction(
        &self,
        account: &Account,
        amount: i64,
        posted: NaiveDate,
        description: &str,
    ) -> BankTransaction {
        self.store
            .insert_transaction(&NewBankTransaction {
                tenant_id: self.tenant_id,
                account_id: account.account_id,
                amount,
                posted_date: posted,
                description: description.to_string(),
                running_balance: None,
            })
            .await
            .unwrap()
    }

    pub async fn invoice(&self, total: i64, issued: NaiveDate, counterparty: &str) -> Invoice {
        self.invoice_with_form(total, issued, counterparty, Some("03"))
            .await
    }

    pub async fn card_invoice(&self, total: i64, issued: NaiveDate, counterparty: &str) -> Invoice {
        self.invoice_with_form(total, issued, counterparty, Some("04"))
            .await
    }

    async fn invoice_with_form(
        &self,
        total: i64,
        issued: NaiveDate,
        counterparty: &str,
        form: Option<&str>,
    ) -> Invoice {
        self.store
            .insert_invoice(&NewInvoice {
                tenant_id: self.tenant_id,
                account_id: None,
                counterparty_tax_id: "XAXX010101000".to_string(),
                counterparty_name: counterparty.to_string(),
                total,
                currency: "MXN".to_string(),
                issue_date: issued,
                payment_method: PaymentMethod::SinglePayment,
                payment_form: form.map(str::to_string),
            })
            .await
            .unwrap()
    }
}
