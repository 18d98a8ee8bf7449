use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::evm::EvmClient;
use super::rest::TronClient;
use super::ChainClient;
use crate::error::{AppResult, ChainError};
use crate::ledger::models::{ChainFamily, Network};
use crate::lifecycle::{relay::RelayLifecycle, OrderLifecycle};
use crate::retry::RetryPolicy;

/// Everything needed to talk to one network
pub struct NetworkHandle {
    pub network: Network,
    pub client: Arc<dyn ChainClient>,
    pub lifecycle: Arc<dyn OrderLifecycle>,
}

impl NetworkHandle {
    pub fn identifier(&self) -> &str {
        &self.network.identifier
    }

    pub fn family(&self) -> ChainFamily {
        self.network.family()
    }
}

/// Transport settings shared by every client the registry builds
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub relayer_url: String,
    pub relayer_api_key: Option<String>,
    pub tron_api_key: Option<String>,
    pub retry: RetryPolicy,
}

/// Per-network clients, built once at startup and shared by every job
#[derive(Default)]
pub struct ChainRegistry {
    handles: HashMap<String, Arc<NetworkHandle>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client pair per network; the family comes from the identifier.
    /// Networks whose endpoint cannot be parsed are left out.
    pub fn from_networks(networks: Vec<Network>, settings: &ClientSettings) -> Self {
        let mut registry = Self::new();
        for network in networks {
            let family = network.family();
            let client: Arc<dyn ChainClient> = match family {
                ChainFamily::Evm => match EvmClient::new(&network, settings.retry) {
                    Ok(client) => Arc::new(client),
                    Err(e) => {
                        warn!("⚠️  Skipping network {}: {}", network.identifier, e);
                        continue;
                    }
                },
                ChainFamily::Rest => Arc::new(TronClient::new(
                    &network,
                    settings.tron_api_key.clone(),
                    settings.retry,
                )),
            };
            let lifecycle: Arc<dyn OrderLifecycle> = Arc::new(RelayLifecycle::new(
                &network,
                &settings.relayer_url,
                settings.relayer_api_key.clone(),
                settings.retry,
            ));
            registry.register(network, client, lifecycle);
        }
        registry
    }

    /// Register a network's clients
    ///
    /// Only call this during system initialization
    pub fn register(
        &mut self,
        network: Network,
        client: Arc<dyn ChainClient>,
        lifecycle: Arc<dyn OrderLifecycle>,
    ) {
        info!(
            "🔗 Registering {} network: {}",
            network.family(),
            network.identifier
        );
        self.handles.insert(
            network.identifier.clone(),
            Arc::new(NetworkHandle {
                network,
                client,
                lifecycle,
            }),
        );
    }

    pub fn get(&self, identifier: &str) -> AppResult<Arc<NetworkHandle>> {
        self.handles
            .get(identifier)
            .cloned()
            .ok_or_else(|| ChainError::UnknownNetwork(identifier.to_string()).into())
    }

    pub fn handles(&self) -> Vec<Arc<NetworkHandle>> {
        self.handles.values().cloned().collect()
    }

    pub fn registered_networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_from_networks_picks_family_by_prefix() {
        let settings = ClientSettings {
            relayer_url: "http://relayer".into(),
            relayer_api_key: None,
            tron_api_key: None,
            retry: RetryPolicy::default(),
        };
        let registry = ChainRegistry::from_networks(
            vec![fixtures::network("base"), fixtures::network("tron-shasta")],
            &settings,
        );

        assert_eq!(registry.registered_networks(), vec!["base", "tron-shasta"]);
        assert_eq!(registry.get("base").unwrap().family(), ChainFamily::Evm);
        assert_eq!(registry.get("tron-shasta").unwrap().family(), ChainFamily::Rest);
        assert!(registry.get("polygon").is_err());
    }

    #[test]
    fn test_misconfigured_network_is_skipped() {
        let settings = ClientSettings {
            relayer_url: "http://relayer".into(),
            relayer_api_key: None,
            tron_api_key: None,
            retry: RetryPolicy::default(),
        };
        let mut broken = fixtures::network("polygon");
        broken.gateway_contract_address = "0xnothex".into();

        let registry = ChainRegistry::from_networks(vec![fixtures::network("base"), broken], &settings);
        assert_eq!(registry.registered_networks(), vec!["base"]);
    }
}
