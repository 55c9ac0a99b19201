//! Reconciliation Engine - Bank transaction to CFDI invoice reconciliation with
//! split matching and installment-plan (MSI) detection.

pub mod applier;
pub mod config;
pub mod error;
pub mod facade;
pub mod installments;
pub mod matching;
pub mod models;
pub mod services;
pub mod store;

pub use config::EngineConfig;
pub use error::{ConflictInvariant, ReconError};
pub use facade::ReconciliationService;
pub use services::{InMemoryStore, PgStore};
pub use store::{EntityStore, LedgerTx};
