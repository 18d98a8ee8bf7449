use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::OrderLifecycle;
use crate::error::{AppResult, OrderError};
use crate::ledger::models::{ChainFamily, LockPaymentOrder, Network, PaymentOrder};
use crate::retry::RetryPolicy;

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    network: &'a str,
    chain_id: i64,
    gateway: &'a str,
    #[serde(flatten)]
    order: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    tx_hash: Option<String>,
}

/// Submits lifecycle calls to the transaction relayer that holds the
/// aggregator's signing keys. One instance per network; the route prefix
/// is chosen by the network's family.
pub struct RelayLifecycle {
    family: ChainFamily,
    network: String,
    chain_id: i64,
    gateway: String,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl RelayLifecycle {
    pub fn new(
        network: &Network,
        base_url: &str,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            family: network.family(),
            network: network.identifier.clone(),
            chain_id: network.chain_id,
            gateway: network.gateway_contract_address.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
            retry,
        }
    }

    fn endpoint(&self, action: &str) -> String {
        format!("{}/v1/{}/orders/{}", self.base_url, self.family, action)
    }

    async fn submit(&self, action: &'static str, order: serde_json::Value) -> AppResult<Option<String>> {
        let url = self.endpoint(action);
        let body = RelayRequest {
            network: &self.network,
            chain_id: self.chain_id,
            gateway: &self.gateway,
            order,
        };

        let response: RelayResponse = self
            .retry
            .run(action, || async {
                let mut request = self.http.post(&url).json(&body);
                if let Some(key) = &self.api_key {
                    request = request.header("X-API-Key", key);
                }
                let response = request.send().await?;
                if response.status().is_server_error() {
                    return Err(crate::error::AppError::ExternalError(format!(
                        "relayer {} returned HTTP {}",
                        action,
                        response.status()
                    )));
                }
                if !response.status().is_success() {
                    let status = response.status();
                    let message = response.text().await.unwrap_or_default();
                    return Err(OrderError::Lifecycle {
                        action,
                        message: format!("HTTP {}: {}", status, message),
                    }
                    .into());
                }
                Ok(response.json::<RelayResponse>().await?)
            })
            .await?;

        info!(
            "📤 {} submitted on {} (tx: {})",
            action,
            self.network,
            response.tx_hash.as_deref().unwrap_or("pending")
        );
        Ok(response.tx_hash)
    }
}

#[async_trait]
impl OrderLifecycle for RelayLifecycle {
    async fn create_order(&self, order: &PaymentOrder) -> AppResult<Option<String>> {
        self.submit(
            "create",
            json!({
                "order_id": order.id,
                "token_id": order.token_id,
                "amount": order.amount.to_string(),
                "rate": order.rate.to_string(),
                "sender_fee": order.sender_fee.to_string(),
                "refund_address": order.return_address,
                "institution": order.recipient.institution,
            }),
        )
        .await
    }

    async fn settle_order(&self, order: &LockPaymentOrder) -> AppResult<Option<String>> {
        self.submit(
            "settle",
            json!({
                "split_order_id": order.id,
                "gateway_id": order.gateway_id,
                "provider_id": order.provider_id,
                "order_percent": order.order_percent.to_string(),
            }),
        )
        .await
    }

    async fn refund_order(&self, network: &Network, gateway_id: &str) -> AppResult<Option<String>> {
        self.submit(
            "refund",
            json!({
                "gateway_id": gateway_id,
                "fee": network.fee.to_string(),
            }),
        )
        .await
    }

    async fn revert_order(&self, order: &PaymentOrder) -> AppResult<Option<String>> {
        self.submit(
            "revert",
            json!({
                "order_id": order.id,
                "token_id": order.token_id,
                "return_address": order.return_address,
                "amount_paid": order.amount_paid.to_string(),
                "amount_returned": order.amount_returned.to_string(),
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_endpoint_uses_family_prefix() {
        let evm = RelayLifecycle::new(
            &fixtures::network("base"),
            "http://relayer/",
            None,
            RetryPolicy::default(),
        );
        let tron = RelayLifecycle::new(
            &fixtures::network("tron-shasta"),
            "http://relayer",
            None,
            RetryPolicy::default(),
        );

        assert_eq!(evm.endpoint("settle"), "http://relayer/v1/evm/orders/settle");
        assert_eq!(tron.endpoint("refund"), "http://relayer/v1/tron/orders/refund");
    }
}
