use std::str::FromStr;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::abi::{self, IGateway, RawLog, IERC20};
use super::{in_block_order, ChainClient, ChainEvent, LogFilter, LogQuery};
use crate::error::{AppResult, ChainError};
use crate::ledger::models::Network;
use crate::retry::RetryPolicy;

/// JSON-RPC client for EVM networks
pub struct EvmClient {
    network: String,
    gateway: Address,
    provider: RootProvider,
    retry: RetryPolicy,
}

impl EvmClient {
    pub fn new(network: &Network, retry: RetryPolicy) -> Result<Self, ChainError> {
        let config_error = |message: String| ChainError::Rpc {
            network: network.identifier.clone(),
            message,
        };
        let url = Url::parse(&network.rpc_endpoint)
            .map_err(|e| config_error(format!("invalid RPC endpoint {}: {}", network.rpc_endpoint, e)))?;
        let gateway = Address::from_str(&network.gateway_contract_address).map_err(|e| {
            config_error(format!(
                "invalid gateway address {}: {}",
                network.gateway_contract_address, e
            ))
        })?;

        Ok(Self {
            network: network.identifier.clone(),
            gateway,
            provider: RootProvider::new(RpcClient::builder().http(url)),
            retry,
        })
    }

    fn rpc_error(&self, message: impl Into<String>) -> ChainError {
        ChainError::Rpc {
            network: self.network.clone(),
            message: message.into(),
        }
    }

    fn decode_error(&self, what: &'static str, message: String) -> ChainError {
        ChainError::Decode {
            network: self.network.clone(),
            what,
            message,
        }
    }

    fn decode(&self, logs: Vec<Log>) -> Vec<ChainEvent> {
        logs.into_iter()
            .filter_map(|log| {
                let tx_hash = log
                    .transaction_hash
                    .map(|h| format!("0x{}", hex::encode(h.as_slice())))
                    .unwrap_or_default();
                let raw = RawLog {
                    address: log.inner.address,
                    data: log.inner.data,
                    block_number: log.block_number.unwrap_or_default(),
                    tx_hash,
                };
                match abi::decode_log(&raw) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            "⚠️  Skipping undecodable log in {} on {}: {}",
                            raw.tx_hash, self.network, e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn build_filter(&self, query: &LogQuery) -> Result<Filter, ChainError> {
        let filter = Filter::new()
            .from_block(query.from_block)
            .to_block(query.to_block);

        let filter = match &query.filter {
            LogFilter::Transfers { token, to } => {
                let token = Address::from_str(token)
                    .map_err(|e| self.decode_error("token address", e.to_string()))?;
                let to = Address::from_str(to)
                    .map_err(|e| self.decode_error("receive address", e.to_string()))?;
                filter
                    .address(token)
                    .event_signature(IERC20::Transfer::SIGNATURE_HASH)
                    .topic2(to.into_word())
            }
            LogFilter::OrderCreated { sender } => {
                let filter = filter
                    .address(self.gateway)
                    .event_signature(IGateway::OrderCreated::SIGNATURE_HASH);
                match sender {
                    Some(sender) => {
                        let sender = Address::from_str(sender)
                            .map_err(|e| self.decode_error("sender address", e.to_string()))?;
                        filter.topic1(sender.into_word())
                    }
                    None => filter,
                }
            }
            LogFilter::OrderSettled { order_id } => {
                let filter = filter
                    .address(self.gateway)
                    .event_signature(IGateway::OrderSettled::SIGNATURE_HASH);
                self.with_order_topic(filter, order_id.as_deref())?
            }
            LogFilter::OrderRefunded { order_id } => {
                let filter = filter
                    .address(self.gateway)
                    .event_signature(IGateway::OrderRefunded::SIGNATURE_HASH);
                self.with_order_topic(filter, order_id.as_deref())?
            }
        };
        Ok(filter)
    }

    fn with_order_topic(&self, filter: Filter, order_id: Option<&str>) -> Result<Filter, ChainError> {
        match order_id {
            Some(id) => {
                let id = B256::from_str(id).map_err(|e| self.decode_error("gateway order id", e.to_string()))?;
                Ok(filter.topic1(id))
            }
            None => Ok(filter),
        }
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn current_block_height(&self) -> AppResult<u64> {
        self.retry
            .run("eth_blockNumber", || async {
                Ok(self
                    .provider
                    .get_block_number()
                    .await
                    .map_err(|e| self.rpc_error(format!("eth_blockNumber failed: {}", e)))?)
            })
            .await
    }

    async fn filter_logs(&self, query: &LogQuery) -> AppResult<Vec<ChainEvent>> {
        let filter = self.build_filter(query)?;
        let logs = self
            .retry
            .run("eth_getLogs", || async {
                Ok(self
                    .provider
                    .get_logs(&filter)
                    .await
                    .map_err(|e| self.rpc_error(format!("eth_getLogs failed: {}", e)))?)
            })
            .await?;

        let events = self.decode(logs);
        debug!(
            "Fetched {} events on {} in blocks {}..={}",
            events.len(),
            self.network,
            query.from_block,
            query.to_block
        );
        Ok(in_block_order(events, query))
    }

    async fn transaction_events(&self, tx_hash: &str) -> AppResult<Vec<ChainEvent>> {
        let hash = B256::from_str(tx_hash).map_err(|e| self.decode_error("transaction hash", e.to_string()))?;
        let receipt = self
            .retry
            .run("eth_getTransactionReceipt", || async {
                Ok(self
                    .provider
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(|e| self.rpc_error(format!("eth_getTransactionReceipt failed: {}", e)))?)
            })
            .await?;

        Ok(receipt
            .map(|r| self.decode(r.inner.logs().to_vec()))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn client() -> EvmClient {
        EvmClient::new(&fixtures::network("base"), RetryPolicy::default()).unwrap()
    }

    #[test]
    fn test_transfer_filter_targets_token_and_recipient() {
        let token = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0xaa);
        let query = LogQuery {
            filter: LogFilter::Transfers {
                token: abi::address_hex(&token),
                to: abi::address_hex(&to),
            },
            from_block: 16,
            to_block: 32,
        };

        let filter = client().build_filter(&query).unwrap();
        assert_eq!(filter.get_from_block(), Some(16));
        assert_eq!(filter.get_to_block(), Some(32));
        assert!(filter.address.matches(&token));
        assert!(!filter.address.matches(&to));
        assert!(filter.topics[0].matches(&IERC20::Transfer::SIGNATURE_HASH));
        assert!(filter.topics[1].is_empty());
        assert!(filter.topics[2].matches(&to.into_word()));
    }

    #[test]
    fn test_gateway_filters_use_gateway_address() {
        let gateway = Address::from_str(fixtures::GATEWAY_ADDRESS).unwrap();
        let order_id = format!("0x{}", "ab".repeat(32));
        let query = LogQuery::recent(
            LogFilter::OrderSettled {
                order_id: Some(order_id.clone()),
            },
            100,
            10,
        );

        let filter = client().build_filter(&query).unwrap();
        assert!(filter.address.matches(&gateway));
        assert!(filter.topics[0].matches(&IGateway::OrderSettled::SIGNATURE_HASH));
        assert!(filter.topics[1].matches(&B256::from_str(&order_id).unwrap()));
    }

    #[test]
    fn test_bad_filter_address_is_a_decode_error() {
        let query = LogQuery::recent(
            LogFilter::Transfers {
                token: "not-an-address".into(),
                to: abi::address_hex(&Address::ZERO),
            },
            100,
            10,
        );
        assert!(matches!(
            client().build_filter(&query),
            Err(ChainError::Decode { what: "token address", .. })
        ));
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let mut network = fixtures::network("base");
        network.rpc_endpoint = "not a url".into();
        assert!(EvmClient::new(&network, RetryPolicy::default()).is_err());
    }
}
