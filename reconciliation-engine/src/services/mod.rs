//! Services module for reconciliation-engine.

pub mod database;
pub mod memory;
pub mod metrics;

pub use database::PgStore;
pub use memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_msi_candidates, record_split_group,
    record_suggestions,
};
