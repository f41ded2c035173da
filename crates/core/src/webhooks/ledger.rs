//! Webhook idempotency ledger
//!
//! One row per (provider, external event id). The claim is a single atomic
//! UPDATE that only one concurrent worker can win; a stale `processing`
//! claim older than the lease timeout is eligible for takeover, so a
//! crashed worker never wedges an event permanently.
//!
//! Event ids are scoped per provider: the same id string from two providers
//! is two independent rows.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{CoreError, CoreResult};

/// SHA-256 of the raw payload, hex-encoded. The ledger's replay detector.
pub fn payload_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Received,
    Processing,
    Processed,
    HashMismatch,
    TenantResolutionFailed,
    ProcessingError,
}

impl LedgerStatus {
    /// Whether the worker's re-drive loop may pick this row up again.
    pub fn is_retry_eligible(self) -> bool {
        matches!(
            self,
            LedgerStatus::Received | LedgerStatus::TenantResolutionFailed
        )
    }
}

/// Result of `record`. Under concurrent deliveries of one event exactly one
/// caller observes `newly_recorded: true`; the rest are duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// This call inserted the row; false for every duplicate delivery.
    pub newly_recorded: bool,
    /// Whether the event's state-changing effect already happened.
    pub already_processed: bool,
    pub status: LedgerStatus,
}

/// Result of `claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller holds the processing lease.
    Granted,
    /// Nothing left to do; includes terminal error states.
    AlreadyProcessed,
    /// Another worker holds a live lease. Benign no-op, do not retry
    /// immediately.
    LeaseHeld,
}

/// How the handler finished; maps onto the row's next status.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Processed,
    /// Transient failure: back to `received`, eligible for retry.
    RetryLater { error: String },
    /// Envelope did not identify a tenant; retry-eligible (the gateway's
    /// transport retry will reattempt).
    TenantResolutionFailed { error: String },
    /// Non-retryable handler failure.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerRow {
    pub provider: String,
    pub external_event_id: String,
    pub payload_hash: String,
    pub payload: serde_json::Value,
    pub status: LedgerStatus,
    pub received_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Record an inbound delivery. Duplicate deliveries with the same
    /// payload are a silent no-op; a different payload under the same
    /// (provider, event id) is a `ReplayHashMismatch`.
    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        raw_payload: &[u8],
    ) -> CoreResult<RecordOutcome>;

    /// Attempt to take the processing lease. Exactly one concurrent caller
    /// wins; the rest observe `AlreadyProcessed` or `LeaseHeld`.
    async fn claim(&self, provider: &str, event_id: &str) -> CoreResult<ClaimOutcome>;

    /// Release the lease with the handler's outcome.
    async fn release(
        &self,
        provider: &str,
        event_id: &str,
        outcome: ReleaseOutcome,
    ) -> CoreResult<()>;

    /// Rows the worker should re-drive (retry-eligible, past a short grace
    /// window so fresh synchronous deliveries are not double-driven).
    async fn retry_eligible(&self, limit: i64) -> CoreResult<Vec<LedgerRow>>;

    /// Safety net: flip stale `processing` rows back to `received`.
    async fn expire_stale_claims(&self) -> CoreResult<u64>;

    /// Retention: drop processed rows older than the window.
    async fn prune_processed(&self, older_than_days: i64) -> CoreResult<u64>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgWebhookLedger {
    pool: PgPool,
    lease_timeout: Duration,
}

impl PgWebhookLedger {
    pub fn new(pool: PgPool, lease_timeout: Duration) -> Self {
        Self {
            pool,
            lease_timeout,
        }
    }
}

#[async_trait]
impl WebhookLedger for PgWebhookLedger {
    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        raw_payload: &[u8],
    ) -> CoreResult<RecordOutcome> {
        let hash = payload_hash(raw_payload);
        let payload: serde_json::Value =
            serde_json::from_slice(raw_payload).unwrap_or(serde_json::Value::Null);

        let inserted: Option<(LedgerStatus,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, external_event_id, payload_hash, payload, status, received_at)
            VALUES ($1, $2, $3, $4, 'received', NOW())
            ON CONFLICT (provider, external_event_id) DO NOTHING
            RETURNING status
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(&hash)
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((status,)) = inserted {
            return Ok(RecordOutcome {
                newly_recorded: true,
                already_processed: false,
                status,
            });
        }

        // Conflict: a row already exists. Hash equality decides between a
        // duplicate delivery (no-op) and a replay with different content.
        let existing: Option<(String, LedgerStatus)> = sqlx::query_as(
            r#"
            SELECT payload_hash, status FROM webhook_events
            WHERE provider = $1 AND external_event_id = $2
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (stored_hash, status) = existing.ok_or_else(|| {
            CoreError::Internal(format!(
                "ledger row for {provider}/{event_id} vanished after conflict"
            ))
        })?;

        if stored_hash != hash {
            // Never let the second payload become authoritative. Processed
            // rows keep their audit status; anything else is stamped.
            if status != LedgerStatus::Processed {
                sqlx::query(
                    r#"
                    UPDATE webhook_events SET status = 'hash_mismatch'
                    WHERE provider = $1 AND external_event_id = $2 AND status <> 'processed'
                    "#,
                )
                .bind(provider)
                .bind(event_id)
                .execute(&self.pool)
                .await?;
            }
            tracing::error!(
                provider = provider,
                event_id = event_id,
                "Replay with different payload hash rejected"
            );
            return Err(CoreError::ReplayHashMismatch {
                provider: provider.to_string(),
                event_id: event_id.to_string(),
            });
        }

        Ok(RecordOutcome {
            newly_recorded: false,
            already_processed: status == LedgerStatus::Processed,
            status,
        })
    }

    async fn claim(&self, provider: &str, event_id: &str) -> CoreResult<ClaimOutcome> {
        let won = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processing', processing_started_at = NOW(), last_error = NULL
            WHERE provider = $1 AND external_event_id = $2
              AND (
                  status IN ('received', 'tenant_resolution_failed')
                  OR (status = 'processing'
                      AND processing_started_at < NOW() - make_interval(secs => $3))
              )
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(self.lease_timeout.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if won == 1 {
            return Ok(ClaimOutcome::Granted);
        }

        let status: Option<(LedgerStatus,)> = sqlx::query_as(
            "SELECT status FROM webhook_events WHERE provider = $1 AND external_event_id = $2",
        )
        .bind(provider)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some((LedgerStatus::Processing,)) => Ok(ClaimOutcome::LeaseHeld),
            Some(_) => Ok(ClaimOutcome::AlreadyProcessed),
            None => Err(CoreError::NotFound(format!(
                "webhook event {provider}/{event_id}"
            ))),
        }
    }

    async fn release(
        &self,
        provider: &str,
        event_id: &str,
        outcome: ReleaseOutcome,
    ) -> CoreResult<()> {
        let (status, error): (LedgerStatus, Option<String>) = match outcome {
            ReleaseOutcome::Processed => (LedgerStatus::Processed, None),
            ReleaseOutcome::RetryLater { error } => (LedgerStatus::Received, Some(error)),
            ReleaseOutcome::TenantResolutionFailed { error } => {
                (LedgerStatus::TenantResolutionFailed, Some(error))
            }
            ReleaseOutcome::Failed { error } => (LedgerStatus::ProcessingError, Some(error)),
        };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $3,
                last_error = $4,
                processed_at = CASE WHEN $3 = 'processed' THEN NOW() ELSE processed_at END,
                processing_started_at = CASE WHEN $3 = 'processed' THEN processing_started_at ELSE NULL END
            WHERE provider = $1 AND external_event_id = $2 AND status = 'processing'
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retry_eligible(&self, limit: i64) -> CoreResult<Vec<LedgerRow>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT provider, external_event_id, payload_hash, payload, status,
                   received_at, processing_started_at, processed_at, last_error
            FROM webhook_events
            WHERE status IN ('received', 'tenant_resolution_failed')
              AND received_at < NOW() - INTERVAL '60 seconds'
            ORDER BY received_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn expire_stale_claims(&self) -> CoreResult<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'received', processing_started_at = NULL,
                last_error = 'lease expired'
            WHERE status = 'processing'
              AND processing_started_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(self.lease_timeout.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if expired > 0 {
            tracing::warn!(expired = expired, "Expired stale webhook processing leases");
        }
        Ok(expired)
    }

    async fn prune_processed(&self, older_than_days: i64) -> CoreResult<u64> {
        let pruned = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE status = 'processed'
              AND processed_at < NOW() - make_interval(days => $1::int)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(pruned)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory ledger with the same contract as [`PgWebhookLedger`]. Backs
/// the concurrency test suites and embedded/demo deployments.
pub struct MemWebhookLedger {
    rows: tokio::sync::Mutex<std::collections::HashMap<(String, String), MemRow>>,
    lease_timeout: Duration,
}

struct MemRow {
    payload_hash: String,
    payload: serde_json::Value,
    status: LedgerStatus,
    received_at: OffsetDateTime,
    processing_started_at: Option<std::time::Instant>,
    processed_at: Option<OffsetDateTime>,
    last_error: Option<String>,
}

impl MemWebhookLedger {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            rows: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            lease_timeout,
        }
    }

    fn key(provider: &str, event_id: &str) -> (String, String) {
        (provider.to_string(), event_id.to_string())
    }
}

#[async_trait]
impl WebhookLedger for MemWebhookLedger {
    async fn record(
        &self,
        provider: &str,
        event_id: &str,
        raw_payload: &[u8],
    ) -> CoreResult<RecordOutcome> {
        let hash = payload_hash(raw_payload);
        let mut rows = self.rows.lock().await;
        match rows.entry(Self::key(provider, event_id)) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(MemRow {
                    payload_hash: hash,
                    payload: serde_json::from_slice(raw_payload)
                        .unwrap_or(serde_json::Value::Null),
                    status: LedgerStatus::Received,
                    received_at: OffsetDateTime::now_utc(),
                    processing_started_at: None,
                    processed_at: None,
                    last_error: None,
                });
                Ok(RecordOutcome {
                    newly_recorded: true,
                    already_processed: false,
                    status: LedgerStatus::Received,
                })
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let row = slot.get_mut();
                if row.payload_hash != hash {
                    if row.status != LedgerStatus::Processed {
                        row.status = LedgerStatus::HashMismatch;
                    }
                    return Err(CoreError::ReplayHashMismatch {
                        provider: provider.to_string(),
                        event_id: event_id.to_string(),
                    });
                }
                Ok(RecordOutcome {
                    newly_recorded: false,
                    already_processed: row.status == LedgerStatus::Processed,
                    status: row.status,
                })
            }
        }
    }

    async fn claim(&self, provider: &str, event_id: &str) -> CoreResult<ClaimOutcome> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&Self::key(provider, event_id)).ok_or_else(|| {
            CoreError::NotFound(format!("webhook event {provider}/{event_id}"))
        })?;

        let claimable = match row.status {
            LedgerStatus::Received | LedgerStatus::TenantResolutionFailed => true,
            LedgerStatus::Processing => row
                .processing_started_at
                .map(|t| t.elapsed() > self.lease_timeout)
                .unwrap_or(true),
            _ => false,
        };

        if claimable {
            row.status = LedgerStatus::Processing;
            row.processing_started_at = Some(std::time::Instant::now());
            row.last_error = None;
            return Ok(ClaimOutcome::Granted);
        }
        match row.status {
            LedgerStatus::Processing => Ok(ClaimOutcome::LeaseHeld),
            _ => Ok(ClaimOutcome::AlreadyProcessed),
        }
    }

    async fn release(
        &self,
        provider: &str,
        event_id: &str,
        outcome: ReleaseOutcome,
    ) -> CoreResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&Self::key(provider, event_id)) {
            if row.status != LedgerStatus::Processing {
                return Ok(());
            }
            match outcome {
                ReleaseOutcome::Processed => {
                    row.status = LedgerStatus::Processed;
                    row.processed_at = Some(OffsetDateTime::now_utc());
                }
                ReleaseOutcome::RetryLater { error } => {
                    row.status = LedgerStatus::Received;
                    row.processing_started_at = None;
                    row.last_error = Some(error);
                }
                ReleaseOutcome::TenantResolutionFailed { error } => {
                    row.status = LedgerStatus::TenantResolutionFailed;
                    row.processing_started_at = None;
                    row.last_error = Some(error);
                }
                ReleaseOutcome::Failed { error } => {
                    row.status = LedgerStatus::ProcessingError;
                    row.processing_started_at = None;
                    row.last_error = Some(error);
                }
            }
        }
        Ok(())
    }

    async fn retry_eligible(&self, limit: i64) -> CoreResult<Vec<LedgerRow>> {
        let rows = self.rows.lock().await;
        let mut out: Vec<LedgerRow> = rows
            .iter()
            .filter(|(_, r)| r.status.is_retry_eligible())
            .map(|((provider, event_id), r)| LedgerRow {
                provider: provider.clone(),
                external_event_id: event_id.clone(),
                payload_hash: r.payload_hash.clone(),
                payload: r.payload.clone(),
                status: r.status,
                received_at: r.received_at,
                processing_started_at: None,
                processed_at: r.processed_at,
                last_error: r.last_error.clone(),
            })
            .collect();
        out.sort_by_key(|r| r.received_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn expire_stale_claims(&self) -> CoreResult<u64> {
        let mut rows = self.rows.lock().await;
        let mut expired = 0;
        for row in rows.values_mut() {
            if row.status == LedgerStatus::Processing
                && row
                    .processing_started_at
                    .map(|t| t.elapsed() > self.lease_timeout)
                    .unwrap_or(true)
            {
                row.status = LedgerStatus::Received;
                row.processing_started_at = None;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn prune_processed(&self, older_than_days: i64) -> CoreResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(older_than_days);
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, r| {
            !(r.status == LedgerStatus::Processed
                && r.processed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> MemWebhookLedger {
        MemWebhookLedger::new(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn duplicate_delivery_with_same_payload_is_a_noop() {
        let ledger = ledger();
        let first = ledger.record("x", "e1", b"{\"a\":1}").await.unwrap();
        assert!(first.newly_recorded);
        assert!(!first.already_processed);

        let second = ledger.record("x", "e1", b"{\"a\":1}").await.unwrap();
        assert!(!second.newly_recorded);
        assert!(!second.already_processed);
        assert_eq!(second.status, LedgerStatus::Received);
    }

    #[tokio::test]
    async fn replay_with_different_payload_is_rejected() {
        let ledger = ledger();
        ledger.record("x", "e1", b"{\"a\":1}").await.unwrap();
        let err = ledger.record("x", "e1", b"{\"a\":2}").await.unwrap_err();
        assert!(matches!(err, CoreError::ReplayHashMismatch { .. }));
    }

    #[tokio::test]
    async fn event_ids_are_scoped_per_provider() {
        let ledger = ledger();
        ledger.record("razor", "e1", b"{\"a\":1}").await.unwrap();
        // Same id, different provider, different payload: independent row.
        let outcome = ledger.record("pay", "e1", b"{\"b\":2}").await.unwrap();
        assert!(outcome.newly_recorded);
        assert!(!outcome.already_processed);
    }

    #[tokio::test]
    async fn only_one_claim_wins_and_release_reopens() {
        let ledger = ledger();
        ledger.record("x", "e1", b"{}").await.unwrap();

        assert_eq!(ledger.claim("x", "e1").await.unwrap(), ClaimOutcome::Granted);
        assert_eq!(
            ledger.claim("x", "e1").await.unwrap(),
            ClaimOutcome::LeaseHeld
        );

        ledger
            .release(
                "x",
                "e1",
                ReleaseOutcome::RetryLater {
                    error: "transient".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(ledger.claim("x", "e1").await.unwrap(), ClaimOutcome::Granted);

        ledger
            .release("x", "e1", ReleaseOutcome::Processed)
            .await
            .unwrap();
        assert_eq!(
            ledger.claim("x", "e1").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
        assert!(ledger.record("x", "e1", b"{}").await.unwrap().already_processed);
    }

    #[tokio::test]
    async fn stale_lease_can_be_taken_over() {
        let ledger = ledger();
        ledger.record("x", "e1", b"{}").await.unwrap();
        assert_eq!(ledger.claim("x", "e1").await.unwrap(), ClaimOutcome::Granted);

        // Crash simulation: never released. After the lease timeout another
        // worker may take over.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ledger.claim("x", "e1").await.unwrap(), ClaimOutcome::Granted);
    }

    #[tokio::test]
    async fn hash_mismatch_rows_are_not_retry_eligible() {
        let ledger = ledger();
        ledger.record("x", "e1", b"{\"a\":1}").await.unwrap();
        let _ = ledger.record("x", "e1", b"{\"a\":2}").await;
        assert_eq!(
            ledger.claim("x", "e1").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
        assert!(ledger.retry_eligible(10).await.unwrap().is_empty());
    }
}
