//! Prometheus metrics for reconciliation-engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for generated suggestions by split kind.
pub static SUGGESTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_suggestions_total",
        "Total number of match suggestions generated",
        &["kind"]
    )
    .expect("Failed to register SUGGESTIONS")
});

/// Counter for split group apply/undo outcomes.
pub static SPLIT_GROUPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_split_groups_total",
        "Total number of split group operations",
        &["operation", "status"]
    )
    .expect("Failed to register SPLIT_GROUPS")
});

/// Counter for persisted installment candidates.
pub static MSI_CANDIDATES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "reconciliation_msi_candidates_total",
        "Total number of installment candidates detected"
    )
    .expect("Failed to register MSI_CANDIDATES")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SUGGESTIONS);
    Lazy::force(&SPLIT_GROUPS);
    Lazy::force(&MSI_CANDIDATES);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format. Encoding failures yield an empty body.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record generated suggestions of one kind.
pub fn record_suggestions(kind: &str, count: usize) {
    SUGGESTIONS.with_label_values(&[kind]).inc_by(count as f64);
}

/// Record a split group operation.
pub fn record_split_group(operation: &str, status: &str) {
    SPLIT_GROUPS.with_label_values(&[operation, status]).inc();
}

/// Record persisted installment candidates.
pub fn record_msi_candidates(count: usize) {
    MSI_CANDIDATES.inc_by(count as f64);
}
