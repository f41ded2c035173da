// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stratabill Core
//!
//! Tenant isolation and billing-event idempotency engine for multi-tenant
//! deployments.
//!
//! ## Features
//!
//! - **Tenant Registry**: Shared vs dedicated datastore routing per tenant
//! - **Connection Lease Cache**: Bounded, lazily-constructed pools for
//!   dedicated tenants with LRU and idle eviction
//! - **Tenant Guard**: Cross-tenant reference enforcement on the data port
//! - **Webhook Ledger**: Exactly-once billing event processing with
//!   payload-hash replay detection and lease-based claims
//! - **Subscriptions**: Gateway-driven lifecycle, renewal invoicing with
//!   immutable snapshots
//! - **Proration**: Deterministic mid-cycle plan change math
//! - **Coupons**: Idempotent redemption and per-period entitlements

pub mod config;
pub mod coupons;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod proration;
pub mod subscriptions;
pub mod tax;
pub mod tenancy;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Config
pub use config::EngineConfig;

// Coupons
pub use coupons::{
    consume_entitlement_period, discount_for, evaluate_coupon, Coupon, CouponDuration,
    CouponPreview, CouponService, DiscountKind, RedemptionResult,
};

// Error
pub use error::{CoreError, CoreResult};

// Events
pub use events::{AuditEntry, AuditLogger, EventBus, RedisEventBus, TracingEventBus};

// Gateway
pub use gateway::{GatewayClient, HttpGatewayClient, NoopGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Proration
pub use proration::{
    compute_proration, normalize_tax_rate, BillingFrequency, PlanPricing, Price, ProrationDelta,
};

// Subscriptions
pub use subscriptions::{
    GatewayEventType, PlanCatalog, PlanChangePreview, PlanChangeResult, Subscription,
    SubscriptionService, SubscriptionStatus,
};

// Tax
pub use tax::{TenantConfigService, TenantTaxConfig};

// Tenancy
pub use tenancy::{
    CacheStats, ConnectionLeaseCache, DataStore, EvictionReason, IsolationMode, MemDataStore,
    PgDataStore, Tenant, TenantGuard, TenantRegistry, TenantScope, TenantStatus,
};

// Webhooks
pub use webhooks::{
    payload_hash, ClaimOutcome, EventDispatcher, IngestOutcome, LedgerRow, LedgerStatus,
    MemWebhookLedger, PgWebhookLedger, RecordOutcome, ReleaseOutcome, SignatureVerifier,
    WebhookEnvelope, WebhookLedger, WebhookProcessor,
};

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

/// The assembled engine: every service wired against the shared
/// control-plane pool.
pub struct EngineServices {
    pub config: EngineConfig,
    pub lease_cache: Arc<ConnectionLeaseCache>,
    pub registry: TenantRegistry,
    pub catalog: PlanCatalog,
    pub coupons: CouponService,
    pub subscriptions: Arc<SubscriptionService>,
    pub ledger: Arc<dyn WebhookLedger>,
    pub processor: Arc<WebhookProcessor>,
    pub invariants: InvariantChecker,
}

impl EngineServices {
    /// Assemble the engine from environment variables. The gateway falls
    /// back to a no-op client and the event bus to log-only when their
    /// endpoints are not configured.
    pub async fn from_env(pool: PgPool) -> CoreResult<Self> {
        let config = EngineConfig::from_env()?;

        let gateway: Arc<dyn GatewayClient> =
            match (std::env::var("GATEWAY_BASE_URL"), std::env::var("GATEWAY_API_KEY")) {
                (Ok(base_url), Ok(api_key)) => Arc::new(HttpGatewayClient::new(base_url, api_key)),
                _ => {
                    tracing::warn!("GATEWAY_BASE_URL not set, using no-op gateway client");
                    Arc::new(NoopGateway)
                }
            };

        let bus: Arc<dyn EventBus> = match std::env::var("REDIS_URL") {
            Ok(url) => Arc::new(RedisEventBus::connect(&url).await?),
            Err(_) => {
                tracing::warn!("REDIS_URL not set, engine events go to logs only");
                Arc::new(TracingEventBus)
            }
        };

        // Per-provider webhook secrets: WEBHOOK_SECRET_RAZORGATE=whsec_...
        // maps to provider "razorgate".
        let secrets: HashMap<String, String> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("WEBHOOK_SECRET_")
                    .map(|provider| (provider.to_lowercase(), value))
            })
            .collect();

        Ok(Self::new(pool, config, gateway, bus, SignatureVerifier::new(secrets)))
    }

    pub fn new(
        pool: PgPool,
        config: EngineConfig,
        gateway: Arc<dyn GatewayClient>,
        bus: Arc<dyn EventBus>,
        verifier: SignatureVerifier,
    ) -> Self {
        let lease_cache = Arc::new(ConnectionLeaseCache::new(&config));
        let registry = TenantRegistry::new(pool.clone(), lease_cache.clone());
        let ledger: Arc<dyn WebhookLedger> =
            Arc::new(PgWebhookLedger::new(pool.clone(), config.lease_timeout));
        let subscriptions = Arc::new(SubscriptionService::new(pool.clone(), gateway, bus));
        let processor = Arc::new(WebhookProcessor::new(
            ledger.clone(),
            registry.clone(),
            subscriptions.clone(),
            verifier,
        ));

        Self {
            lease_cache,
            registry,
            catalog: PlanCatalog::new(pool.clone()),
            coupons: CouponService::new(pool.clone()),
            subscriptions,
            ledger,
            processor,
            invariants: InvariantChecker::new(pool, config.lease_timeout),
            config,
        }
    }
}
