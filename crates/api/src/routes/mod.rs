//! Route definitions

mod coupons;
mod subscriptions;
mod tenants;
mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhooks::ingest))
        .route("/tenants", post(tenants::create))
        .route("/tenants/{tenant_id}", get(tenants::show))
        .route("/tenants/{tenant_id}/status", post(tenants::set_status))
        .route(
            "/tenants/{tenant_id}/datasource",
            post(tenants::set_datasource),
        )
        .route(
            "/tenants/{tenant_id}/subscription",
            post(subscriptions::create),
        )
        .route(
            "/tenants/{tenant_id}/subscription/change-plan",
            post(subscriptions::change_plan),
        )
        .route(
            "/tenants/{tenant_id}/subscription/cancel",
            post(subscriptions::cancel),
        )
        .route("/coupons/validate", post(coupons::validate))
        .route(
            "/tenants/{tenant_id}/subscription/coupons",
            post(coupons::redeem),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
