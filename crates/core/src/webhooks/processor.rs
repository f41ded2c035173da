//! Webhook ingestion pipeline
//!
//! Drives a raw gateway delivery through signature verification, envelope
//! parsing, the idempotency ledger, tenant resolution, and handler dispatch.
//! Duplicate deliveries and lease contention resolve to benign no-ops so the
//! gateway sees a 2xx and stops retrying; replay-with-different-payload and
//! signature failures are surfaced loudly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::tenancy::{Tenant, TenantRegistry};
use crate::webhooks::ledger::{ClaimOutcome, ReleaseOutcome, WebhookLedger};

/// Normalized inbound gateway event. Providers differ on field naming, so
/// the required fields carry aliases for the common variants.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(alias = "id", alias = "eventId")]
    pub external_event_id: String,
    #[serde(rename = "event_type", alias = "type", alias = "eventType")]
    pub event_type: String,
    #[serde(default, alias = "tenantId")]
    pub tenant_id: Option<Uuid>,
    #[serde(default, alias = "subscriptionId", alias = "subscription_id")]
    pub external_subscription_id: Option<String>,
    #[serde(default, alias = "amount")]
    pub amount_minor: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl WebhookEnvelope {
    pub fn parse(raw: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(raw).map_err(|e| CoreError::EnvelopeMalformed(e.to_string()))
    }
}

/// Verifies `t=<unix>,v1=<hex>` signature headers: HMAC-SHA256 over
/// `"{t}.{body}"` with the provider's shared secret, with a timestamp
/// tolerance window against replay of captured deliveries.
pub struct SignatureVerifier {
    secrets: HashMap<String, String>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets,
            tolerance: Duration::from_secs(300),
        }
    }

    /// Providers without a configured secret skip verification. Used for
    /// local development against gateway simulators.
    pub fn unverified() -> Self {
        Self::new(HashMap::new())
    }

    pub fn verify(&self, provider: &str, header: Option<&str>, body: &[u8]) -> CoreResult<()> {
        self.verify_at(
            provider,
            header,
            body,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    fn verify_at(
        &self,
        provider: &str,
        header: Option<&str>,
        body: &[u8],
        now_unix: i64,
    ) -> CoreResult<()> {
        let Some(secret) = self.secrets.get(provider) else {
            return Ok(());
        };
        let header = header
            .ok_or_else(|| CoreError::WebhookSignatureInvalid(provider.to_string()))?;

        let mut timestamp: Option<i64> = None;
        let mut signature: Option<&str> = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = v.parse().ok(),
                Some(("v1", v)) => signature = Some(v),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(CoreError::WebhookSignatureInvalid(provider.to_string())),
        };

        if (now_unix - timestamp).unsigned_abs() > self.tolerance.as_secs() {
            return Err(CoreError::WebhookSignatureInvalid(provider.to_string()));
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| CoreError::Internal(format!("hmac key: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        // Constant-time comparison is not load-bearing here (the secret is
        // never derivable from timing), but keep it cheap and exact.
        if expected != signature {
            return Err(CoreError::WebhookSignatureInvalid(provider.to_string()));
        }
        Ok(())
    }
}

/// The billing side of the pipeline: maps subscription-scoped envelopes to
/// their owning tenant and applies the event's state effects.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn tenant_for_subscription(&self, external_subscription_id: &str) -> CoreResult<Uuid>;

    async fn dispatch(&self, tenant: &Tenant, envelope: &WebhookEnvelope) -> CoreResult<()>;
}

/// What the API layer reports back to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed,
    /// This event already took effect; no state changed.
    Duplicate,
    /// Another worker is processing it right now; no state changed.
    LeaseHeld,
    /// Accepted but not applied: the tenant could not be resolved. The row
    /// stays retry-eligible for the re-drive loop.
    Deferred,
}

pub struct WebhookProcessor {
    ledger: Arc<dyn WebhookLedger>,
    registry: TenantRegistry,
    dispatcher: Arc<dyn EventDispatcher>,
    verifier: SignatureVerifier,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<dyn WebhookLedger>,
        registry: TenantRegistry,
        dispatcher: Arc<dyn EventDispatcher>,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            ledger,
            registry,
            dispatcher,
            verifier,
        }
    }

    /// Full ingestion of a raw delivery.
    pub async fn ingest(
        &self,
        provider: &str,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> CoreResult<IngestOutcome> {
        self.verifier.verify(provider, signature_header, raw_body)?;
        let envelope = WebhookEnvelope::parse(raw_body)?;

        let recorded = self
            .ledger
            .record(provider, &envelope.external_event_id, raw_body)
            .await?;
        if recorded.already_processed {
            tracing::debug!(
                provider = provider,
                event_id = %envelope.external_event_id,
                "Duplicate delivery, already processed"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        match self
            .ledger
            .claim(provider, &envelope.external_event_id)
            .await?
        {
            ClaimOutcome::Granted => {}
            ClaimOutcome::AlreadyProcessed => return Ok(IngestOutcome::Duplicate),
            ClaimOutcome::LeaseHeld => {
                tracing::debug!(
                    provider = provider,
                    event_id = %envelope.external_event_id,
                    "Processing lease held elsewhere"
                );
                return Ok(IngestOutcome::LeaseHeld);
            }
        }

        self.drive_claimed(provider, &envelope).await
    }

    /// Re-drive a previously recorded event (worker retry loop). The caller
    /// must already hold the claim.
    pub async fn drive_claimed(
        &self,
        provider: &str,
        envelope: &WebhookEnvelope,
    ) -> CoreResult<IngestOutcome> {
        let tenant = match self.resolve_tenant(envelope).await {
            Ok(tenant) => tenant,
            Err(e) => {
                tracing::warn!(
                    provider = provider,
                    event_id = %envelope.external_event_id,
                    error = %e,
                    "Tenant resolution failed, deferring event"
                );
                self.ledger
                    .release(
                        provider,
                        &envelope.external_event_id,
                        ReleaseOutcome::TenantResolutionFailed {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                return Ok(IngestOutcome::Deferred);
            }
        };

        match self.dispatcher.dispatch(&tenant, envelope).await {
            Ok(()) => {
                self.ledger
                    .release(
                        provider,
                        &envelope.external_event_id,
                        ReleaseOutcome::Processed,
                    )
                    .await?;
                Ok(IngestOutcome::Processed)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    provider = provider,
                    event_id = %envelope.external_event_id,
                    error = %e,
                    "Handler failed transiently, event re-queued"
                );
                self.ledger
                    .release(
                        provider,
                        &envelope.external_event_id,
                        ReleaseOutcome::RetryLater {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    provider = provider,
                    event_id = %envelope.external_event_id,
                    error = %e,
                    "Handler failed permanently"
                );
                self.ledger
                    .release(
                        provider,
                        &envelope.external_event_id,
                        ReleaseOutcome::Failed {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn resolve_tenant(&self, envelope: &WebhookEnvelope) -> CoreResult<Tenant> {
        let tenant_id = match envelope.tenant_id {
            Some(id) => id,
            None => {
                let sub_id = envelope.external_subscription_id.as_deref().ok_or_else(|| {
                    CoreError::TenantResolutionFailed(
                        "envelope carries neither tenant_id nor subscription id".to_string(),
                    )
                })?;
                self.dispatcher.tenant_for_subscription(sub_id).await?
            }
        };
        self.registry
            .resolve(tenant_id)
            .await
            .map_err(|e| CoreError::TenantResolutionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_for(provider: &str, secret: &str) -> SignatureVerifier {
        let mut secrets = HashMap::new();
        secrets.insert(provider.to_string(), secret.to_string());
        SignatureVerifier::new(secrets)
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let v = verifier_for("razor", "whsec_test");
        let body = br#"{"id":"e1"}"#;
        let header = sign("whsec_test", 1_700_000_000, body);
        assert!(v
            .verify_at("razor", Some(&header), body, 1_700_000_100)
            .is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let v = verifier_for("razor", "whsec_test");
        let body = br#"{"id":"e1"}"#;
        let header = sign("whsec_test", 1_700_000_000, body);
        let err = v
            .verify_at("razor", Some(&header), body, 1_700_000_000 + 301)
            .unwrap_err();
        assert!(matches!(err, CoreError::WebhookSignatureInvalid(_)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let v = verifier_for("razor", "whsec_test");
        let header = sign("whsec_test", 1_700_000_000, br#"{"id":"e1"}"#);
        let err = v
            .verify_at("razor", Some(&header), br#"{"id":"e2"}"#, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, CoreError::WebhookSignatureInvalid(_)));
    }

    #[test]
    fn missing_header_is_rejected_when_secret_configured() {
        let v = verifier_for("razor", "whsec_test");
        assert!(v.verify_at("razor", None, b"{}", 0).is_err());
        // Unconfigured providers skip verification.
        assert!(v.verify_at("other", None, b"{}", 0).is_ok());
    }

    #[test]
    fn envelope_accepts_provider_field_aliases() {
        let e = WebhookEnvelope::parse(
            br#"{"id":"evt_1","type":"payment.succeeded","amount":499,"currency":"usd"}"#,
        )
        .unwrap();
        assert_eq!(e.external_event_id, "evt_1");
        assert_eq!(e.event_type, "payment.succeeded");
        assert_eq!(e.amount_minor, Some(499));

        let e = WebhookEnvelope::parse(
            br#"{"eventId":"evt_2","eventType":"subscription.activated","subscriptionId":"sub_9"}"#,
        )
        .unwrap();
        assert_eq!(e.external_event_id, "evt_2");
        assert_eq!(e.external_subscription_id.as_deref(), Some("sub_9"));
    }

    #[test]
    fn garbage_body_is_envelope_malformed() {
        assert!(matches!(
            WebhookEnvelope::parse(b"not json").unwrap_err(),
            CoreError::EnvelopeMalformed(_)
        ));
    }
}
