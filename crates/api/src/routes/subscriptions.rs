//! Subscription management
//!
//! Plan changes run against the tenant's single billable subscription.
//! `?preview=true` returns the proration without committing; the commit
//! path uses the identical computation.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use stratabill_core::Subscription;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    pub currency: String,
    /// Days of trial before the first charge; omitted means no trial.
    pub trial_days: Option<i64>,
}

pub async fn create(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<Subscription>> {
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    let sub = state
        .engine
        .subscriptions
        .create(&tenant, req.plan_id, &req.currency, req.trial_days)
        .await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanQuery {
    #[serde(default)]
    pub preview: bool,
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ChangePlanQuery>,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Response> {
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    let sub = state
        .engine
        .subscriptions
        .billable_for_tenant(tenant_id)
        .await?;

    if query.preview {
        let preview = state
            .engine
            .subscriptions
            .preview_plan_change(&tenant, sub.id, req.plan_id)
            .await?;
        return Ok(Json(preview).into_response());
    }

    let result = state
        .engine
        .subscriptions
        .commit_plan_change(&tenant, sub.id, req.plan_id)
        .await?;
    Ok(Json(result).into_response())
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    let sub = state
        .engine
        .subscriptions
        .billable_for_tenant(tenant_id)
        .await?;
    state.engine.subscriptions.cancel(&tenant, sub.id).await?;
    Ok(Json(serde_json::json!({ "cancelled": sub.id })))
}
