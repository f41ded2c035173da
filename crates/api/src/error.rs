//! HTTP error mapping
//!
//! Isolation and replay violations surface loudly; benign no-op outcomes
//! never reach this type (handlers map them to 2xx directly). Retryable
//! engine failures become 5xx so the gateway's transport retry reattempts
//! delivery.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use stratabill_core::CoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let ApiError::Core(e) = self;
        match e {
            CoreError::CrossTenantReference { .. } => StatusCode::FORBIDDEN,
            CoreError::ReplayHashMismatch { .. } => StatusCode::CONFLICT,
            CoreError::WebhookSignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            CoreError::EnvelopeMalformed(_) | CoreError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::PriceUnavailable { .. } | CoreError::CouponInvalid(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CoreError::TenantNotFound(_)
            | CoreError::SubscriptionNotFound(_)
            | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::GatewayOperationFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::TenantResolutionFailed(_)
            | CoreError::Database(_)
            | CoreError::LeaseCache(_)
            | CoreError::Serialization(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let ApiError::Core(ref e) = self;

        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        } else {
            tracing::warn!(error = %e, status = %status, "Request rejected");
        }

        let body = Json(json!({
            "error": e.to_string(),
        }));
        (status, body).into_response()
    }
}
