//! Engine error taxonomy
//!
//! Every fallible engine operation returns [`CoreResult`]. The variants map
//! directly onto the propagation policy used by the API layer: guard and
//! replay violations are always surfaced, tenant-resolution failures stay
//! retry-eligible, and lease contention is a benign no-op rather than an
//! error at all (see `webhooks::ClaimOutcome`).

use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A data operation referenced an entity owned by a different tenant.
    /// Always a bug or an attempted breach; never retried, surfaced loud.
    #[error("cross-tenant reference: {entity} {id} is not owned by tenant {tenant_id}")]
    CrossTenantReference {
        entity: &'static str,
        id: Uuid,
        tenant_id: Uuid,
    },

    /// Same (provider, event id) delivered again with a different payload.
    #[error("replay hash mismatch for {provider} event {event_id}")]
    ReplayHashMismatch { provider: String, event_id: String },

    /// The webhook envelope did not carry enough information to identify a
    /// tenant. Retryable: the ledger row stays in a retry-eligible state.
    #[error("tenant resolution failed: {0}")]
    TenantResolutionFailed(String),

    /// No price defined for the requested (currency, billing frequency)
    /// combination. User-facing 4xx; proration must never default to zero.
    #[error("no price for plan {plan_id} in {currency}/{frequency}")]
    PriceUnavailable {
        plan_id: Uuid,
        currency: String,
        frequency: String,
    },

    /// A remote gateway operation failed. Local state must not advance.
    #[error("gateway operation failed: {0}")]
    GatewayOperationFailed(String),

    #[error("coupon rejected: {0}")]
    CouponInvalid(String),

    #[error("webhook signature invalid for provider {0}")]
    WebhookSignatureInvalid(String),

    #[error("webhook envelope malformed: {0}")]
    EnvelopeMalformed(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(Uuid),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("connection lease cache error: {0}")]
    LeaseCache(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl CoreError {
    /// Whether the webhook pipeline may leave the ledger row retry-eligible
    /// for this failure. Guard and replay violations never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TenantResolutionFailed(_)
                | CoreError::Database(_)
                | CoreError::GatewayOperationFailed(_)
        )
    }
}
