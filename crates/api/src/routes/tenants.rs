//! Tenant provisioning and lifecycle

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use stratabill_core::{Tenant, TenantStatus};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> ApiResult<Json<Tenant>> {
    let tenant = state.engine.registry.create(&req.name).await?;
    Ok(Json(tenant))
}

pub async fn show(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Tenant>> {
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    Ok(Json(tenant))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: TenantStatus,
}

pub async fn set_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> ApiResult<Json<Tenant>> {
    state.engine.registry.set_status(tenant_id, req.status).await?;
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    Ok(Json(tenant))
}

/// Move a tenant between shared and dedicated isolation. A `locator` moves
/// it to (or within) dedicated; omitting it returns the tenant to the
/// shared datastore. Either way the previous dedicated pool is evicted.
#[derive(Debug, Deserialize)]
pub struct SetDatasourceRequest {
    pub locator: Option<String>,
}

pub async fn set_datasource(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<SetDatasourceRequest>,
) -> ApiResult<Json<Tenant>> {
    match req.locator.as_deref() {
        Some(locator) => {
            state
                .engine
                .registry
                .set_datasource_locator(tenant_id, locator)
                .await?;
        }
        None => {
            state.engine.registry.set_shared_isolation(tenant_id).await?;
        }
    }
    let tenant = state.engine.registry.resolve(tenant_id).await?;
    Ok(Json(tenant))
}
