use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::abi::{self, RawLog};
use super::{in_block_order, ChainClient, ChainEvent, LogFilter, LogQuery, TransferEvent};
use crate::error::{AppResult, ChainError};
use crate::ledger::models::Network;
use crate::retry::RetryPolicy;

const API_KEY_HEADER: &str = "TRON-PRO-API-KEY";
const PAGE_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Trc20Transfer {
    transaction_id: String,
    from: String,
    to: String,
    value: String,
    token_info: Option<Trc20TokenInfo>,
}

#[derive(Debug, Deserialize)]
struct Trc20TokenInfo {
    address: String,
}

#[derive(Debug, Deserialize)]
struct ContractEvent {
    transaction_id: String,
    block_number: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfo {
    #[serde(default)]
    block_number: u64,
    #[serde(default)]
    log: Vec<TronLog>,
}

#[derive(Debug, Deserialize)]
struct TronLog {
    address: String,
    topics: Vec<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct NowBlock {
    block_header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    raw_data: BlockRawData,
}

#[derive(Debug, Deserialize)]
struct BlockRawData {
    number: u64,
}

/// REST client for account-model ledgers (TronGrid API)
pub struct TronClient {
    network: String,
    base_url: String,
    gateway: String,
    api_key: Option<String>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl TronClient {
    pub fn new(network: &Network, api_key: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            network: network.identifier.clone(),
            base_url: network.rpc_endpoint.trim_end_matches('/').to_string(),
            gateway: network.gateway_contract_address.clone(),
            api_key,
            http: reqwest::Client::new(),
            retry,
        }
    }

    fn rpc_error(&self, message: impl Into<String>) -> ChainError {
        ChainError::Rpc {
            network: self.network.clone(),
            message: message.into(),
        }
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        self.retry
            .run(path, || async {
                let response = self
                    .with_key(self.http.get(&url))
                    .send()
                    .await
                    .map_err(|e| self.rpc_error(format!("GET {} failed: {:?}", path, e)))?;
                if !response.status().is_success() {
                    return Err(self
                        .rpc_error(format!("GET {} returned HTTP {}", path, response.status()))
                        .into());
                }
                Ok(response
                    .json::<T>()
                    .await
                    .map_err(|e| self.rpc_error(format!("GET {} invalid body: {:?}", path, e)))?)
            })
            .await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        self.retry
            .run(path, || async {
                let response = self
                    .with_key(self.http.post(&url))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| self.rpc_error(format!("POST {} failed: {:?}", path, e)))?;
                if !response.status().is_success() {
                    return Err(self
                        .rpc_error(format!("POST {} returned HTTP {}", path, response.status()))
                        .into());
                }
                Ok(response
                    .json::<T>()
                    .await
                    .map_err(|e| self.rpc_error(format!("POST {} invalid body: {:?}", path, e)))?)
            })
            .await
    }

    async fn transaction_info(&self, tx_hash: &str) -> AppResult<TransactionInfo> {
        self.post("/wallet/gettransactioninfobyid", json!({ "value": tx_hash }))
            .await
    }

    /// Confirmed token transfers received by `address`
    pub async fn account_transfers(&self, address: &str, token: &str) -> AppResult<Vec<TransferEvent>> {
        let path = format!(
            "/v1/accounts/{}/transactions/trc20?only_to=true&only_confirmed=true&limit={}&contract_address={}",
            address, PAGE_LIMIT, token
        );
        let page: Page<Trc20Transfer> = self.get(&path).await?;

        let mut transfers = Vec::with_capacity(page.data.len());
        for item in page.data {
            let value = match item.value.parse::<u128>() {
                Ok(value) => value,
                Err(e) => {
                    warn!("⚠️  Skipping transfer {} with bad value: {}", item.transaction_id, e);
                    continue;
                }
            };
            let info = self.transaction_info(&item.transaction_id).await?;
            transfers.push(TransferEvent {
                block_number: info.block_number,
                tx_hash: item.transaction_id,
                token: item
                    .token_info
                    .map(|t| t.address)
                    .unwrap_or_else(|| token.to_string()),
                from: item.from,
                to: item.to,
                value,
            });
        }
        Ok(transfers)
    }

    async fn contract_event_transactions(&self, event_name: &str, query: &LogQuery) -> AppResult<BTreeSet<String>> {
        let path = format!(
            "/v1/contracts/{}/events?event_name={}&only_confirmed=true&order_by=block_timestamp,desc&limit={}",
            self.gateway, event_name, PAGE_LIMIT
        );
        let page: Page<ContractEvent> = self.get(&path).await?;
        Ok(page
            .data
            .into_iter()
            .filter(|e| (query.from_block..=query.to_block).contains(&e.block_number))
            .map(|e| e.transaction_id)
            .collect())
    }
}

#[async_trait]
impl ChainClient for TronClient {
    async fn current_block_height(&self) -> AppResult<u64> {
        let block: NowBlock = self.post("/wallet/getnowblock", json!({})).await?;
        Ok(block.block_header.raw_data.number)
    }

    async fn filter_logs(&self, query: &LogQuery) -> AppResult<Vec<ChainEvent>> {
        let event_name = match &query.filter {
            LogFilter::Transfers { token, to } => {
                let events = self
                    .account_transfers(to, token)
                    .await?
                    .into_iter()
                    .map(ChainEvent::Transfer)
                    .collect();
                return Ok(in_block_order(events, query));
            }
            LogFilter::OrderCreated { .. } => "OrderCreated",
            LogFilter::OrderSettled { .. } => "OrderSettled",
            LogFilter::OrderRefunded { .. } => "OrderRefunded",
        };

        let mut events = Vec::new();
        for tx_hash in self.contract_event_transactions(event_name, query).await? {
            events.extend(
                self.transaction_events(&tx_hash)
                    .await?
                    .into_iter()
                    .filter(|e| e.matches(&query.filter)),
            );
        }
        debug!("Fetched {} {} events on {}", events.len(), event_name, self.network);
        Ok(in_block_order(events, query))
    }

    async fn transaction_events(&self, tx_hash: &str) -> AppResult<Vec<ChainEvent>> {
        let info = self.transaction_info(tx_hash).await?;
        let mut events = Vec::new();
        for log in info.log {
            let decoded = RawLog::from_hex(&log.address, &log.topics, &log.data, info.block_number, tx_hash)
                .and_then(|raw| abi::decode_log(&raw));
            match decoded {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("⚠️  Skipping undecodable log in {} on {}: {}", tx_hash, self.network, e),
            }
        }
        Ok(events)
    }
}
