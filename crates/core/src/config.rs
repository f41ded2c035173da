//! Engine configuration
//!
//! Loaded once at process start (`EngineConfig::from_env`) and passed into
//! the components that need it. No module-level globals: the connection
//! lease cache, ledger, and gateway client are all constructed explicitly
//! and injected.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Tunables for the webhook ledger and tenant connection handling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a `processing` claim may be held before another worker can
    /// take it over.
    pub lease_timeout: Duration,
    /// Maximum number of live dedicated-datastore pools kept in the cache.
    pub cache_max_entries: usize,
    /// Idle time after which a cached dedicated pool is evicted.
    pub cache_idle_ttl: Duration,
    /// Per-pool connection cap for dedicated tenant datastores. Deliberately
    /// separate from the shared pool's cap.
    pub dedicated_pool_size: u32,
    /// Retention window for processed ledger rows (worker prune job).
    pub ledger_retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(120),
            cache_max_entries: 32,
            cache_idle_ttl: Duration::from_secs(600),
            dedicated_pool_size: 5,
            ledger_retention_days: 90,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> CoreResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            lease_timeout: env_secs("WEBHOOK_LEASE_TIMEOUT_SECS")?
                .unwrap_or(defaults.lease_timeout),
            cache_max_entries: env_parse("TENANT_CACHE_MAX_ENTRIES")?
                .unwrap_or(defaults.cache_max_entries),
            cache_idle_ttl: env_secs("TENANT_CACHE_IDLE_TTL_SECS")?
                .unwrap_or(defaults.cache_idle_ttl),
            dedicated_pool_size: env_parse("TENANT_DEDICATED_POOL_SIZE")?
                .unwrap_or(defaults.dedicated_pool_size),
            ledger_retention_days: env_parse("WEBHOOK_LEDGER_RETENTION_DAYS")?
                .unwrap_or(defaults.ledger_retention_days),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> CoreResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| CoreError::InvalidInput(format!("{key} is not a valid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> CoreResult<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.lease_timeout, Duration::from_secs(120));
        assert!(cfg.cache_max_entries > 0);
    }
}
