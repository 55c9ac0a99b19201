//! Configuration module for reconciliation-engine.

use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub matching: MatchingConfig,
    pub installments: InstallmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// Tuning for the similarity scorer and the suggestion passes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Relative amount delta beyond which a pair is disqualified.
    pub amount_tolerance: f64,
    pub direct_date_window_days: u32,
    pub split_date_window_days: u32,
    pub min_score: f64,
    pub min_split_score: f64,
    pub max_combination_size: usize,
    /// Multiplied into a subset score once per entity beyond the first.
    pub subset_penalty: f64,
    pub max_search_nodes: usize,
    pub max_subsets_per_target: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: 0.02,
            direct_date_window_days: 7,
            split_date_window_days: 30,
            min_score: 0.80,
            min_split_score: 0.60,
            max_combination_size: 5,
            subset_penalty: 0.95,
            max_search_nodes: 100_000,
            max_subsets_per_target: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstallmentConfig {
    pub plan_lengths: Vec<u32>,
    pub amount_tolerance: f64,
    /// How far back an invoice may have been issued before the charge.
    pub lookback_days: u32,
}

impl Default for InstallmentConfig {
    fn default() -> Self {
        Self {
            plan_lengths: vec![3, 6, 9, 12, 18, 24],
            amount_tolerance: 0.02,
            lookback_days: 730,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: "reconciliation-engine".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: None,
            matching: MatchingConfig::default(),
            installments: InstallmentConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `configuration.*` and `APP__` environment variables, then validate.
    pub fn from_env() -> Result<Self, AppError> {
        let config: Self = core_config::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Install the global tracing subscriber for a host process.
    pub fn init_tracing(&self) {
        service_core::observability::init_tracing(
            &self.service_name,
            &self.log_level,
            self.otlp_endpoint.as_deref(),
        );
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let m = &self.matching;
        let i = &self.installments;

        let checks: [(bool, &str); 9] = [
            (
                m.amount_tolerance > 0.0 && m.amount_tolerance < 1.0,
                "matching.amount_tolerance must be in (0, 1)",
            ),
            (
                m.direct_date_window_days > 0 && m.split_date_window_days > 0,
                "matching date windows must be positive",
            ),
            (
                (0.0..=1.0).contains(&m.min_score) && (0.0..=1.0).contains(&m.min_split_score),
                "matching score thresholds must be in [0, 1]",
            ),
            (
                m.max_combination_size >= 2,
                "matching.max_combination_size must be at least 2",
            ),
            (
                m.subset_penalty > 0.0 && m.subset_penalty <= 1.0,
                "matching.subset_penalty must be in (0, 1]",
            ),
            (
                m.max_search_nodes > 0 && m.max_subsets_per_target > 0,
                "matching search bounds must be positive",
            ),
            (
                !i.plan_lengths.is_empty() && i.plan_lengths.iter().all(|n| *n >= 2),
                "installments.plan_lengths must be non-empty and each at least 2",
            ),
            (
                i.amount_tolerance > 0.0 && i.amount_tolerance < 1.0,
                "installments.amount_tolerance must be in (0, 1)",
            ),
            (
                i.lookback_days > 0,
                "installments.lookback_days must be positive",
            ),
        ];

        for (ok, message) in checks {
            if !ok {
                return Err(AppError::ConfigError(anyhow::anyhow!(message)));
            }
        }

        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "database.url is required when a database section is present"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.installments.plan_lengths, vec![3, 6, 9, 12, 18, 24]);
        assert_eq!(config.matching.max_combination_size, 5);
    }

    #[test]
    fn rejects_single_period_plans() {
        let mut config = EngineConfig::default();
        config.installments.plan_lengths = vec![1, 6];
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn rejects_degenerate_combination_bound() {
        let mut config = EngineConfig::default();
        config.matching.max_combination_size = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let matching: MatchingConfig =
            serde_json::from_str(r#"{ "min_score": 0.9 }"#).unwrap();
        assert_eq!(matching.min_score, 0.9);
        assert_eq!(matching.direct_date_window_days, 7);
    }
}
