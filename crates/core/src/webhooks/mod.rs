//! Webhook ingestion
//!
//! [`ledger`] is the durable idempotency record — every inbound gateway
//! event lands there exactly once per (provider, external event id), with
//! payload-hash consistency and a lease-based processing claim.
//! [`processor`] drives the record → claim → dispatch → release pipeline.

pub mod ledger;
pub mod processor;

pub use ledger::{
    payload_hash, ClaimOutcome, LedgerRow, LedgerStatus, MemWebhookLedger, PgWebhookLedger,
    RecordOutcome, ReleaseOutcome, WebhookLedger,
};
pub use processor::{
    EventDispatcher, IngestOutcome, SignatureVerifier, WebhookEnvelope, WebhookProcessor,
};
