//! Gateway webhook intake
//!
//! One endpoint per provider path segment. Benign outcomes (duplicate
//! delivery, lease contention) return 200 so the gateway stops retrying;
//! deferred tenant resolution returns 202; replay-with-different-payload
//! is a 409 and a transient handler failure is a 5xx that invites the
//! gateway's own retry.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use stratabill_core::IngestOutcome;

use crate::error::ApiResult;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn ingest(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .engine
        .processor
        .ingest(&provider, &body, signature)
        .await?;

    let (code, status) = match outcome {
        IngestOutcome::Processed => (StatusCode::OK, "processed"),
        IngestOutcome::Duplicate => (StatusCode::OK, "duplicate"),
        IngestOutcome::LeaseHeld => (StatusCode::OK, "in_progress"),
        IngestOutcome::Deferred => (StatusCode::ACCEPTED, "accepted"),
    };

    Ok((code, Json(json!({ "status": status }))))
}
