//! Payment gateway port
//!
//! Remote mutations go through [`GatewayClient`]. The ordering contract for
//! every caller: remote first, local commit second. If the remote call
//! fails, local state must not advance.

use async_trait::async_trait;
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Returns the gateway's subscription identifier.
    async fn create_remote_subscription(
        &self,
        tenant_id: Uuid,
        plan_code: &str,
        currency: &str,
    ) -> CoreResult<String>;

    async fn update_remote_plan(
        &self,
        external_subscription_id: &str,
        plan_code: &str,
    ) -> CoreResult<()>;

    async fn cancel_remote_subscription(&self, external_subscription_id: &str) -> CoreResult<()>;

    /// Returns the gateway's refund identifier.
    async fn refund(&self, external_charge_id: &str, amount_minor: i64) -> CoreResult<String>;
}

/// REST client for the configured gateway. Retries transient transport
/// failures with jittered exponential backoff; 4xx responses are not
/// retried.
pub struct HttpGatewayClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGatewayClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn backoff() -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(200).map(jitter).take(3)
    }

    async fn post(&self, path: &str, body: Value) -> CoreResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = Retry::spawn(Self::backoff(), || async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CoreError::GatewayOperationFailed(e.to_string()))?;

            if resp.status().is_server_error() {
                return Err(CoreError::GatewayOperationFailed(format!(
                    "{} returned {}",
                    path,
                    resp.status()
                )));
            }
            Ok(resp)
        })
        .await?;

        if !response.status().is_success() {
            return Err(CoreError::GatewayOperationFailed(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CoreError::GatewayOperationFailed(e.to_string()))
    }

    fn extract_id(body: &Value, path: &str) -> CoreResult<String> {
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CoreError::GatewayOperationFailed(format!("{path} response missing id"))
            })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn create_remote_subscription(
        &self,
        tenant_id: Uuid,
        plan_code: &str,
        currency: &str,
    ) -> CoreResult<String> {
        let body = self
            .post(
                "/v1/subscriptions",
                serde_json::json!({
                    "reference": tenant_id,
                    "plan": plan_code,
                    "currency": currency,
                }),
            )
            .await?;
        Self::extract_id(&body, "/v1/subscriptions")
    }

    async fn update_remote_plan(
        &self,
        external_subscription_id: &str,
        plan_code: &str,
    ) -> CoreResult<()> {
        self.post(
            &format!("/v1/subscriptions/{external_subscription_id}/plan"),
            serde_json::json!({ "plan": plan_code }),
        )
        .await?;
        Ok(())
    }

    async fn cancel_remote_subscription(&self, external_subscription_id: &str) -> CoreResult<()> {
        self.post(
            &format!("/v1/subscriptions/{external_subscription_id}/cancel"),
            serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn refund(&self, external_charge_id: &str, amount_minor: i64) -> CoreResult<String> {
        let body = self
            .post(
                "/v1/refunds",
                serde_json::json!({
                    "charge": external_charge_id,
                    "amount": amount_minor,
                }),
            )
            .await?;
        Self::extract_id(&body, "/v1/refunds")
    }
}

/// Gateway stub for deployments without a configured gateway (local dev,
/// tests). Mints deterministic-looking ids and always succeeds.
pub struct NoopGateway;

#[async_trait]
impl GatewayClient for NoopGateway {
    async fn create_remote_subscription(
        &self,
        tenant_id: Uuid,
        plan_code: &str,
        _currency: &str,
    ) -> CoreResult<String> {
        tracing::debug!(tenant_id = %tenant_id, plan = plan_code, "Noop gateway: create subscription");
        Ok(format!("sub_local_{}", Uuid::new_v4().simple()))
    }

    async fn update_remote_plan(
        &self,
        external_subscription_id: &str,
        plan_code: &str,
    ) -> CoreResult<()> {
        tracing::debug!(
            subscription = external_subscription_id,
            plan = plan_code,
            "Noop gateway: update plan"
        );
        Ok(())
    }

    async fn cancel_remote_subscription(&self, external_subscription_id: &str) -> CoreResult<()> {
        tracing::debug!(subscription = external_subscription_id, "Noop gateway: cancel");
        Ok(())
    }

    async fn refund(&self, external_charge_id: &str, amount_minor: i64) -> CoreResult<String> {
        tracing::debug!(
            charge = external_charge_id,
            amount_minor = amount_minor,
            "Noop gateway: refund"
        );
        Ok(format!("re_local_{}", Uuid::new_v4().simple()))
    }
}
