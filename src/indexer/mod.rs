//! Chain events to order state.
//!
//! Every entry point is safe to re-run over the same block window: the
//! store rejects already-recorded transfers, gateway ids and split orders,
//! so duplicates fall through as no-ops.

pub mod deposits;
pub mod orders;
pub mod splitter;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::assignment::PriorityQueueService;
use crate::chain::{ChainEvent, ChainRegistry, NetworkHandle};
use crate::compliance::{ComplianceDecision, ComplianceOracle};
use crate::config::OrderConfig;
use crate::error::{AppResult, OrderError};
use crate::ledger::models::{ChainFamily, PaymentOrder, Token};
use crate::ledger::OrderStore;
use crate::notifications::WebhookNotifier;
use crate::recipient::RecipientCodec;

pub struct Indexer {
    store: Arc<dyn OrderStore>,
    registry: Arc<ChainRegistry>,
    queue: Arc<PriorityQueueService>,
    compliance: Arc<dyn ComplianceOracle>,
    recipients: RecipientCodec,
    webhooks: Arc<WebhookNotifier>,
    config: OrderConfig,
    /// AML screening runs only in production
    aml_enabled: bool,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: Arc<ChainRegistry>,
        queue: Arc<PriorityQueueService>,
        compliance: Arc<dyn ComplianceOracle>,
        recipients: RecipientCodec,
        webhooks: Arc<WebhookNotifier>,
        config: OrderConfig,
        aml_enabled: bool,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            compliance,
            recipients,
            webhooks,
            config,
            aml_enabled,
        }
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    /// Network handle and token an order was funded with
    pub async fn handle_for_order(&self, order: &PaymentOrder) -> AppResult<(Arc<NetworkHandle>, Token)> {
        let token = self
            .store
            .token(order.token_id)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("token {}", order.token_id)))?;
        let handle = self.registry.get(&token.network)?;
        Ok((handle, token))
    }

    /// AML decision for a funding transaction. Oracle failures are logged
    /// and let the order through.
    async fn screen(&self, handle: &NetworkHandle, tx_hash: &str) -> ComplianceDecision {
        if !self.aml_enabled || handle.family() != ChainFamily::Evm {
            return ComplianceDecision::Allow;
        }
        match self
            .compliance
            .check_compliance(&handle.network.rpc_endpoint, tx_hash)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                error!("❌ AML check for {} failed: {}", tx_hash, e);
                ComplianceDecision::Allow
            }
        }
    }

    async fn process_event(&self, handle: &NetworkHandle, event: &ChainEvent) -> AppResult<()> {
        match event {
            ChainEvent::OrderCreated(e) => self.create_lock_payment_order(handle, e).await,
            ChainEvent::OrderSettled(e) => self.update_order_status_settled(handle, e).await,
            ChainEvent::OrderRefunded(e) => self.update_order_status_refunded(handle, e).await,
            ChainEvent::Transfer(e) => {
                debug!("Transfer {} is indexed through its receive address", e.tx_hash);
                Ok(())
            }
        }
    }

    /// Apply events in order; one failure never stops its siblings
    async fn process_batch(&self, handle: &NetworkHandle, events: Vec<ChainEvent>) -> usize {
        let mut applied = 0;
        for event in events {
            match self.process_event(handle, &event).await {
                Ok(()) => applied += 1,
                Err(e) => error!(
                    "❌ Failed to process event in {} on {}: {}",
                    event.tx_hash(),
                    handle.identifier(),
                    e
                ),
            }
        }
        applied
    }

    /// Index every gateway event emitted by one transaction
    pub async fn index_transaction(&self, handle: &NetworkHandle, tx_hash: &str) -> AppResult<usize> {
        let events = handle.client.transaction_events(tx_hash).await?;
        if events.is_empty() {
            warn!("⚠️  No gateway events in {} on {}", tx_hash, handle.identifier());
        }
        Ok(self.process_batch(handle, events).await)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::assignment::MemoryAssignmentCache;
    use crate::ledger::MemoryOrderStore;
    use crate::recipient::RecipientCodec;
    use crate::testing::fakes::{FakeChainClient, FakeCompliance, PlainDecryptor, RecordingLifecycle};
    use crate::testing::fixtures;

    /// Indexer over in-memory collaborators with one `base` network
    pub struct Harness {
        pub indexer: Indexer,
        pub store: MemoryOrderStore,
        pub cache: MemoryAssignmentCache,
        pub chain: Arc<FakeChainClient>,
        pub lifecycle: Arc<RecordingLifecycle>,
        pub handle: Arc<NetworkHandle>,
    }

    pub fn harness(chain: FakeChainClient, compliance: Option<ComplianceDecision>, aml_enabled: bool) -> Harness {
        let store = MemoryOrderStore::new();
        let cache = MemoryAssignmentCache::new();
        let chain = Arc::new(chain);
        let lifecycle = Arc::new(RecordingLifecycle::default());

        let mut registry = ChainRegistry::new();
        registry.register(fixtures::network("base"), chain.clone(), lifecycle.clone());
        let registry = Arc::new(registry);
        let handle = registry.get("base").unwrap();

        let config = OrderConfig::default();
        let shared_store: Arc<dyn OrderStore> = Arc::new(store.clone());
        let queue = Arc::new(PriorityQueueService::new(
            shared_store.clone(),
            Arc::new(cache.clone()),
            config.clone(),
        ));
        let webhooks = Arc::new(WebhookNotifier::new(shared_store.clone(), &config));

        let indexer = Indexer::new(
            shared_store,
            registry,
            queue,
            Arc::new(FakeCompliance(compliance)),
            RecipientCodec::new(Arc::new(PlainDecryptor)),
            webhooks,
            config,
            aml_enabled,
        );

        Harness {
            indexer,
            store,
            cache,
            chain,
            lifecycle,
            handle,
        }
    }

    #[tokio::test]
    async fn test_screen_skips_when_disabled() {
        let h = harness(FakeChainClient::new(10, vec![]), Some(ComplianceDecision::Deny), false);
        assert_eq!(h.indexer.screen(&h.handle, "0xtx").await, ComplianceDecision::Allow);
    }

    #[tokio::test]
    async fn test_screen_oracle_outage_allows() {
        let h = harness(FakeChainClient::new(10, vec![]), None, true);
        assert_eq!(h.indexer.screen(&h.handle, "0xtx").await, ComplianceDecision::Allow);

        let h = harness(FakeChainClient::new(10, vec![]), Some(ComplianceDecision::Deny), true);
        assert_eq!(h.indexer.screen(&h.handle, "0xtx").await, ComplianceDecision::Deny);
    }
}
