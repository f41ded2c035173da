//! Coupon validation and redemption

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use stratabill_core::{CouponPreview, RedemptionResult};

use crate::error::ApiResult;
use crate::state::AppState;

/// Forever-duration coupons only validate with a `subscription_id` to
/// attach to; bounded durations can be previewed anonymously.
#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub amount_minor: i64,
    pub currency: String,
}

pub async fn validate(
    State(state): State<AppState>,
    Json(req): Json<ValidateCouponRequest>,
) -> ApiResult<Json<CouponPreview>> {
    let preview = state
        .engine
        .coupons
        .preview(
            &req.code,
            req.plan_id,
            req.subscription_id,
            req.amount_minor,
            &req.currency,
        )
        .await?;
    Ok(Json(preview))
}

/// `redemption_key` is caller-supplied and idempotent: replaying the same
/// key is a no-op acknowledged with the original outcome.
#[derive(Debug, Deserialize)]
pub struct RedeemCouponRequest {
    pub code: String,
    pub redemption_key: String,
}

pub async fn redeem(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<RedeemCouponRequest>,
) -> ApiResult<Json<RedemptionResult>> {
    let sub = state
        .engine
        .subscriptions
        .billable_for_tenant(tenant_id)
        .await?;
    let result = state
        .engine
        .coupons
        .redeem(&req.code, sub.id, Some(sub.plan_id), &req.redemption_key)
        .await?;
    Ok(Json(result))
}
