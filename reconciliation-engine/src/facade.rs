//! Entry point for callers: wires the store, the matching passes, the
//! installment detector and the applier behind one cloneable handle.

use crate::applier::SplitApplier;
use crate::config::EngineConfig;
use crate::error::ReconError;
use crate::installments::InstallmentDetector;
use crate::matching::SuggestionGenerator;
use crate::models::{
    DateWindow, MsiCandidate, MsiStatus, ReconciliationSummary, SplitGroup, SplitKind, Suggestion,
};
use crate::services::metrics::{
    init_metrics, record_error, record_msi_candidates, record_split_group, record_suggestions,
};
use crate::services::{InMemoryStore, PgStore};
use crate::store::EntityStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn EntityStore>,
    generator: SuggestionGenerator,
    detector: InstallmentDetector,
    applier: SplitApplier,
    split_window_days: u32,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn EntityStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            generator: SuggestionGenerator::new(config.matching.clone()),
            detector: InstallmentDetector::new(config.installments.clone()),
            applier: SplitApplier::new(config.matching.amount_tolerance),
            split_window_days: config.matching.split_date_window_days,
        }
    }

    /// Build the engine from configuration: Postgres when a `database` section
    /// is present (migrations applied), otherwise the in-memory store.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, ReconError> {
        config.validate()?;
        init_metrics();

        let store: Arc<dyn EntityStore> = match &config.database {
            Some(db) => {
                let store = PgStore::new(&db.url, db.max_connections, db.min_connections).await?;
                store.run_migrations().await?;
                store.health_check().await?;
                Arc::new(store)
            }
            None => {
                warn!("No database configured, using in-memory store");
                Arc::new(InMemoryStore::new())
            }
        };

        info!(service = %config.service_name, "Reconciliation engine ready");
        Ok(Self::new(store, config))
    }

    /// The underlying store, for ingestion collaborators.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Ranked suggestions for transactions posted inside `window`. Invoices are
    /// considered up to the split date window beyond either edge.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn suggestions(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Suggestion>, ReconError> {
        let result = async {
            window.validate()?;
            let margin = Duration::days(i64::from(self.split_window_days));
            let invoice_window = window.widen(margin, margin);

            let transactions = self.store.open_transactions(tenant_id, window, None).await?;
            let invoices = self.store.open_invoices(tenant_id, invoice_window).await?;
            self.generator.generate(tenant_id, &transactions, &invoices)
        }
        .await;

        let suggestions = observe("suggestions", result)?;
        for kind in [SplitKind::OneToOne, SplitKind::OneToMany, SplitKind::ManyToOne] {
            let count = suggestions.iter().filter(|s| s.kind == kind).count();
            if count > 0 {
                record_suggestions(kind.as_str(), count);
            }
        }
        info!(count = suggestions.len(), "Suggestions generated");
        Ok(suggestions)
    }

    /// Detect installment plans on a credit-card account and persist the new
    /// candidates. Returns only what was stored by this call.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id))]
    pub async fn detect_installments(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        let result = async {
            let detected = self
                .detector
                .detect(self.store.as_ref(), tenant_id, account_id, window)
                .await?;
            if detected.is_empty() {
                return Ok(detected);
            }
            self.store.save_msi_candidates(&detected).await
        }
        .await;

        let saved = observe("detect_installments", result)?;
        record_msi_candidates(saved.len());
        info!(count = saved.len(), "Installment candidates detected");
        Ok(saved)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn installment_candidates(
        &self,
        tenant_id: Uuid,
        status: Option<MsiStatus>,
    ) -> Result<Vec<MsiCandidate>, ReconError> {
        observe(
            "installment_candidates",
            self.store.list_msi_candidates(tenant_id, status).await,
        )
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    pub async fn accept_installment(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
        created_by: &str,
    ) -> Result<SplitGroup, ReconError> {
        let result = self
            .applier
            .accept_installment(self.store.as_ref(), tenant_id, candidate_id, created_by)
            .await;
        record_outcome("accept_installment", &result);
        observe("accept_installment", result)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, candidate_id = %candidate_id))]
    pub async fn discard_installment(
        &self,
        tenant_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<MsiCandidate, ReconError> {
        observe(
            "discard_installment",
            self.store.discard_msi_candidate(tenant_id, candidate_id).await,
        )
    }

    #[instrument(skip(self, suggestion), fields(tenant_id = %tenant_id, kind = suggestion.kind.as_str()))]
    pub async fn apply(
        &self,
        tenant_id: Uuid,
        suggestion: &Suggestion,
        created_by: &str,
    ) -> Result<SplitGroup, ReconError> {
        let result = self
            .applier
            .apply(self.store.as_ref(), tenant_id, suggestion, created_by)
            .await;
        record_outcome("apply", &result);
        observe("apply", result)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, split_group_id = %split_group_id))]
    pub async fn undo(
        &self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError> {
        let result = self
            .applier
            .undo(self.store.as_ref(), tenant_id, split_group_id)
            .await;
        record_outcome("undo", &result);
        observe("undo", result)
    }

    pub async fn split_group(
        &self,
        tenant_id: Uuid,
        split_group_id: Uuid,
    ) -> Result<SplitGroup, ReconError> {
        observe(
            "split_group",
            self.store.get_split_group(tenant_id, split_group_id).await,
        )
    }

    pub async fn split_groups(
        &self,
        tenant_id: Uuid,
        include_reversed: bool,
    ) -> Result<Vec<SplitGroup>, ReconError> {
        observe(
            "split_groups",
            self.store.list_split_groups(tenant_id, include_reversed).await,
        )
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn summary(
        &self,
        tenant_id: Uuid,
        window: DateWindow,
    ) -> Result<ReconciliationSummary, ReconError> {
        observe("summary", self.store.summary(tenant_id, window).await)
    }
}

fn record_outcome<T>(operation: &str, result: &Result<T, ReconError>) {
    let status = match result {
        Ok(_) => "success",
        Err(ReconError::ReconciliationConflict { .. }) => "conflict",
        Err(_) => "error",
    };
    record_split_group(operation, status);
}

/// Count and log a failed call, passing the result through.
fn observe<T>(operation: &str, result: Result<T, ReconError>) -> Result<T, ReconError> {
    if let Err(e) = &result {
        record_error(e.error_type());
        match e {
            ReconError::ReconciliationConflict {
                entity, invariant, ..
            } => warn!(
                operation = operation,
                entity = %entity,
                invariant = %invariant,
                "Reconciliation conflict"
            ),
            ReconError::Storage(_) => warn!(operation = operation, error = %e, "Storage failure"),
            _ => {}
        }
    }
    result
}
