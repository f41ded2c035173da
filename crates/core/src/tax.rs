//! Tenant tax configuration
//!
//! The engine does not calculate jurisdiction-specific tax itself; it reads
//! the tenant's configured rate and applies it to invoice and proration
//! amounts. A tenant with no tax configuration pays zero tax — absence is
//! a normal state, never an error.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::proration::normalize_tax_rate;

/// Tax settings stored per tenant under the `tax` config key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantTaxConfig {
    /// Raw configured rate; accepts a 0–1 fraction or a 0–100 percentage.
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

impl TenantTaxConfig {
    /// The normalized fraction in [0, 1] used for all tax arithmetic.
    pub fn rate(&self) -> f64 {
        normalize_tax_rate(self.percent)
    }
}

/// Reads tenant configuration values from the shared datastore.
#[derive(Clone)]
pub struct TenantConfigService {
    pool: PgPool,
}

impl TenantConfigService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the tax configuration for a tenant. Missing config or a
    /// malformed value both degrade to the zero-tax default; a malformed
    /// value is logged since it indicates an operator mistake.
    pub async fn tax_config(&self, tenant_id: Uuid) -> CoreResult<TenantTaxConfig> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT value FROM tenant_configs WHERE tenant_id = $1 AND config_key = 'tax'",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Database(e.to_string()))?;

        match row {
            None => Ok(TenantTaxConfig::default()),
            Some((value,)) => match serde_json::from_value::<TenantTaxConfig>(value) {
                Ok(cfg) => Ok(cfg),
                Err(e) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Malformed tenant tax config, defaulting to zero tax"
                    );
                    Ok(TenantTaxConfig::default())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_zero_tax() {
        let cfg = TenantTaxConfig::default();
        assert_eq!(cfg.rate(), 0.0);
    }

    #[test]
    fn percent_and_fraction_forms_normalize_identically() {
        let fraction = TenantTaxConfig {
            percent: 0.18,
            jurisdiction: None,
        };
        let percent = TenantTaxConfig {
            percent: 18.0,
            jurisdiction: Some("IN".to_string()),
        };
        assert_eq!(fraction.rate(), percent.rate());
    }

    #[test]
    fn config_json_round_trips() {
        let value = serde_json::json!({ "percent": 7.25, "jurisdiction": "US-CA" });
        let cfg: TenantTaxConfig = serde_json::from_value(value).unwrap();
        assert_eq!(cfg.jurisdiction.as_deref(), Some("US-CA"));
        assert!((cfg.rate() - 0.0725).abs() < 1e-9);
    }
}
