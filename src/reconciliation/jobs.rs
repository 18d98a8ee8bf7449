use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::rates::{compute_market_rates, PriceFeed};
use crate::assignment::PriorityQueueService;
use crate::chain::{ChainRegistry, NetworkHandle};
use crate::config::OrderConfig;
use crate::error::AppResult;
use crate::indexer::Indexer;
use crate::ledger::models::LockPaymentOrder;
use crate::ledger::OrderStore;
use crate::notifications::WebhookNotifier;

/// Log a failed stream and count it as zero
fn settle_count(stream: &str, network: &str, result: AppResult<usize>) -> usize {
    match result {
        Ok(n) => n,
        Err(e) => {
            error!("❌ {} indexing failed on {}: {}", stream, network, e);
            0
        }
    }
}

fn distinct_gateway_ids(orders: &[LockPaymentOrder]) -> BTreeSet<String> {
    orders.iter().map(|o| o.gateway_id.clone()).collect()
}

/// The periodic sweeps that re-drive stalled orders. Every job is
/// idempotent and may overlap a previous run of itself.
pub struct ReconciliationJobs {
    store: Arc<dyn OrderStore>,
    registry: Arc<ChainRegistry>,
    indexer: Arc<Indexer>,
    queue: Arc<PriorityQueueService>,
    webhooks: Arc<WebhookNotifier>,
    price_feed: Arc<dyn PriceFeed>,
    config: OrderConfig,
}

impl ReconciliationJobs {
    pub fn new(
        store: Arc<dyn OrderStore>,
        indexer: Arc<Indexer>,
        queue: Arc<PriorityQueueService>,
        webhooks: Arc<WebhookNotifier>,
        price_feed: Arc<dyn PriceFeed>,
        config: OrderConfig,
    ) -> Self {
        Self {
            store,
            registry: indexer.registry().clone(),
            indexer,
            queue,
            webhooks,
            price_feed,
            config,
        }
    }

    // ========== CHAIN EVENTS ==========

    /// All four event streams for every network, networks in parallel
    pub async fn index_blockchain_events(&self) -> AppResult<usize> {
        let handles = self.registry.handles();
        let applied: usize = join_all(handles.iter().map(|h| self.index_network(h)))
            .await
            .into_iter()
            .sum();
        debug!("Indexed {} events across {} networks", applied, handles.len());
        Ok(applied)
    }

    async fn index_network(&self, handle: &NetworkHandle) -> usize {
        let network = handle.identifier();
        let (deposits, created, settled, refunded) = tokio::join!(
            self.indexer.index_deposits(handle),
            self.indexer.index_order_created(handle, None),
            self.index_settlements(handle),
            self.index_refunds(handle),
        );

        settle_count("Deposit", network, deposits)
            + settle_count("OrderCreated", network, created)
            + settle_count("OrderSettled", network, settled)
            + settle_count("OrderRefunded", network, refunded)
    }

    async fn index_settlements(&self, handle: &NetworkHandle) -> AppResult<usize> {
        let awaiting = self
            .store
            .lock_orders_awaiting_settlement_event(handle.identifier())
            .await?;
        let mut applied = 0;
        for gateway_id in distinct_gateway_ids(&awaiting) {
            applied += self.indexer.index_order_settled(handle, Some(&gateway_id)).await?;
        }
        Ok(applied)
    }

    async fn index_refunds(&self, handle: &NetworkHandle) -> AppResult<usize> {
        let created_before = Utc::now() - Duration::minutes(self.config.refund_index_age_mins);
        let awaiting = self
            .store
            .lock_orders_awaiting_refund_event(handle.identifier(), created_before)
            .await?;
        let mut applied = 0;
        for gateway_id in distinct_gateway_ids(&awaiting) {
            applied += self.indexer.index_order_refunded(handle, Some(&gateway_id)).await?;
        }
        Ok(applied)
    }

    // ========== STALE OPERATIONS ==========

    /// Re-issue create, revert, settle and refund calls that never landed
    pub async fn retry_stale_user_operations(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut retried = 0;

        let pending_creation = self
            .store
            .orders_pending_creation(now - Duration::minutes(self.config.create_window_mins))
            .await?;
        for order in &pending_creation {
            let result = async {
                let (handle, _) = self.indexer.handle_for_order(order).await?;
                self.indexer.create_on_chain(&handle, order).await
            }
            .await;
            match result {
                Ok(()) => retried += 1,
                Err(e) => error!("❌ Create retry failed for order {}: {}", order.id, e),
            }
        }

        let to_revert = self
            .store
            .orders_to_revert(now - Duration::minutes(self.config.revert_idle_mins))
            .await?;
        for order in &to_revert {
            let result = async {
                let (handle, _) = self.indexer.handle_for_order(order).await?;
                handle.lifecycle.revert_order(order).await
            }
            .await;
            match result {
                Ok(_) => retried += 1,
                Err(e) => error!("❌ Revert retry failed for order {}: {}", order.id, e),
            }
        }

        let to_settle = self
            .store
            .lock_orders_to_settle(now - Duration::minutes(self.config.settle_idle_mins))
            .await?;
        for order in &to_settle {
            let result = async {
                let handle = self.registry.get(&order.network)?;
                handle.lifecycle.settle_order(order).await
            }
            .await;
            match result {
                Ok(_) => retried += 1,
                Err(e) => error!("❌ Settle retry failed for lock order {}: {}", order.id, e),
            }
        }

        let to_refund = self
            .store
            .lock_orders_to_refund(now - Duration::minutes(self.config.refund_age_mins))
            .await?;
        let mut refunded = BTreeSet::new();
        for order in &to_refund {
            if !refunded.insert((order.network.clone(), order.gateway_id.clone())) {
                continue;
            }
            let result = async {
                let handle = self.registry.get(&order.network)?;
                handle.lifecycle.refund_order(&handle.network, &order.gateway_id).await
            }
            .await;
            match result {
                Ok(_) => retried += 1,
                Err(e) => error!("❌ Refund retry failed for gateway order {}: {}", order.gateway_id, e),
            }
        }

        if retried > 0 {
            info!(
                "🔁 Retried {} stale operations ({} create, {} revert, {} settle, {} refund)",
                retried,
                pending_creation.len(),
                to_revert.len(),
                to_settle.len(),
                refunded.len()
            );
        }
        Ok(retried)
    }

    // ========== HOUSEKEEPING ==========

    pub async fn handle_receive_address_validity(&self) -> AppResult<usize> {
        self.indexer.sweep_receive_address_validity().await
    }

    pub async fn compute_market_rate(&self) -> AppResult<usize> {
        compute_market_rates(
            &self.store,
            &self.price_feed,
            self.config.percent_deviation_from_market_rate,
        )
        .await
    }

    pub async fn process_bucket_queues(&self) -> AppResult<usize> {
        self.queue.process_bucket_queues().await
    }

    pub async fn retry_failed_webhooks(&self) -> AppResult<usize> {
        self.webhooks.retry_failed_webhooks().await
    }

    /// Assign pending lock orders that hold no live reservation
    pub async fn reassign_pending_orders(&self) -> AppResult<usize> {
        let validity = Duration::seconds(self.config.order_request_validity_secs as i64);
        let pending = self.store.pending_lock_orders(Utc::now() - validity).await?;

        let mut reassigned = 0;
        for order in &pending {
            if self.queue.has_live_reservation(order.id).await? {
                continue;
            }
            match self.queue.assign_lock_payment_order(order).await {
                Ok(provider) => {
                    debug!("Lock order {} reassigned to {}", order.id, provider);
                    reassigned += 1;
                }
                Err(e) => warn!("⚠️  Lock order {} still unassigned: {}", order.id, e),
            }
        }
        if reassigned > 0 {
            info!("🔄 Reassigned {} pending lock orders", reassigned);
        }
        Ok(reassigned)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::assignment::priority_queue::order_request_key;
    use crate::assignment::{AssignmentCache, MemoryAssignmentCache};
    use crate::chain::ChainEvent;
    use crate::compliance::ComplianceDecision;
    use crate::indexer::orders::tests::{gateway_id, order_created};
    use crate::ledger::models::*;
    use crate::ledger::MemoryOrderStore;
    use crate::recipient::RecipientCodec;
    use crate::testing::fakes::{FakeChainClient, FakeCompliance, FakePriceFeed, PlainDecryptor, RecordingLifecycle};
    use crate::testing::fixtures;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    pub struct Setup {
        pub jobs: ReconciliationJobs,
        pub store: MemoryOrderStore,
        pub cache: MemoryAssignmentCache,
        pub chain: Arc<FakeChainClient>,
        pub lifecycle: Arc<RecordingLifecycle>,
    }

    pub fn setup() -> Setup {
        setup_with_compliance(None)
    }

    pub fn setup_with_compliance(decision: Option<ComplianceDecision>) -> Setup {
        let store = MemoryOrderStore::new();
        let cache = MemoryAssignmentCache::new();
        let chain = Arc::new(FakeChainClient::new(1_000, vec![]));
        let lifecycle = Arc::new(RecordingLifecycle::default());

        let mut registry = ChainRegistry::new();
        registry.register(fixtures::network("base"), chain.clone(), lifecycle.clone());

        let config = OrderConfig::default();
        let shared: Arc<dyn OrderStore> = Arc::new(store.clone());
        let queue = Arc::new(PriorityQueueService::new(
            shared.clone(),
            Arc::new(cache.clone()),
            config.clone(),
        ));
        let webhooks = Arc::new(WebhookNotifier::new(shared.clone(), &config));
        let indexer = Arc::new(Indexer::new(
            shared.clone(),
            Arc::new(registry),
            queue.clone(),
            Arc::new(FakeCompliance(decision)),
            RecipientCodec::new(Arc::new(PlainDecryptor)),
            webhooks.clone(),
            config.clone(),
            decision.is_some(),
        ));

        let jobs = ReconciliationJobs::new(
            shared,
            indexer,
            queue,
            webhooks,
            Arc::new(FakePriceFeed::default()),
            config,
        );
        Setup {
            jobs,
            store,
            cache,
            chain,
            lifecycle,
        }
    }

    async fn lock_order(store: &MemoryOrderStore, token: &Token, status: LockOrderStatus, age: Duration) -> LockPaymentOrder {
        let mut order = fixtures::new_lock_order(token, &Uuid::new_v4().to_string(), dec!(50))
            .into_lock_order(Utc::now() - age);
        order.gateway_id = format!("0x{}", Uuid::new_v4().simple());
        order.status = status;
        store.insert_lock_order(order.clone()).await;
        order
    }

    #[tokio::test]
    async fn test_index_blockchain_events_runs_every_stream() {
        let s = setup();
        let buckets = fixtures::seed_ngn_market(&s.store, &[(dec!(1000), dec!(100000))]).await;
        fixtures::seed_token(&s.store).await;
        fixtures::seed_provider(&s.store, "prov-0", &[buckets[0].id], dec!(1)).await;
        s.chain
            .push(ChainEvent::OrderCreated(order_created(21, 50_000_000, 1500, None)));

        assert_eq!(s.jobs.index_blockchain_events().await.unwrap(), 1);
        let orders = s.store.lock_orders_by_gateway_id(&gateway_id(21)).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert!(s.cache.get(&order_request_key(orders[0].id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_index_blockchain_events_survives_chain_outage() {
        let s = setup();
        let mut registry = ChainRegistry::new();
        registry.register(
            fixtures::network("base"),
            Arc::new(FakeChainClient::failing()),
            s.lifecycle.clone(),
        );
        let store: Arc<dyn OrderStore> = Arc::new(s.store.clone());
        let config = OrderConfig::default();
        let queue = Arc::new(PriorityQueueService::new(
            store.clone(),
            Arc::new(s.cache.clone()),
            config.clone(),
        ));
        let webhooks = Arc::new(WebhookNotifier::new(store.clone(), &config));
        let indexer = Arc::new(Indexer::new(
            store.clone(),
            Arc::new(registry),
            queue.clone(),
            Arc::new(FakeCompliance(None)),
            RecipientCodec::new(Arc::new(PlainDecryptor)),
            webhooks.clone(),
            config.clone(),
            false,
        ));
        let jobs = ReconciliationJobs::new(store, indexer, queue, webhooks, Arc::new(FakePriceFeed::default()), config);

        assert_eq!(jobs.index_blockchain_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_stale_user_operations() {
        let s = setup();

        // fully paid, address used, never created on chain
        let (mut paid, mut address, token) = fixtures::seed_payment_order(&s.store, dec!(100)).await;
        paid.amount_paid = dec!(100);
        address.status = ReceiveAddressStatus::Used;
        s.store.insert_payment_order(paid.clone()).await;
        s.store.insert_receive_address(address).await;

        // expired with a partial deposit, idle for 20 minutes
        let (mut partial, mut lapsed, _) = fixtures::seed_payment_order(&s.store, dec!(100)).await;
        partial.amount_paid = dec!(40);
        partial.status = PaymentOrderStatus::Expired;
        partial.updated_at = Utc::now() - Duration::minutes(20);
        lapsed.status = ReceiveAddressStatus::Expired;
        s.store.insert_payment_order(partial.clone()).await;
        s.store.insert_receive_address(lapsed).await;

        let validated = lock_order(&s.store, &token, LockOrderStatus::Validated, Duration::minutes(10)).await;
        s.store
            .insert_fulfillment(LockOrderFulfillment {
                id: Uuid::new_v4(),
                lock_order_id: validated.id,
                tx_id: Some("bank-ref-1".into()),
                validation_status: ValidationStatus::Success,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        let stuck = lock_order(&s.store, &token, LockOrderStatus::Pending, Duration::hours(1)).await;
        // too young to refund
        lock_order(&s.store, &token, LockOrderStatus::Pending, Duration::minutes(5)).await;

        assert_eq!(s.jobs.retry_stale_user_operations().await.unwrap(), 4);

        let calls = s.lifecycle.calls();
        assert!(calls.contains(&("create", paid.id.to_string())));
        assert!(calls.contains(&("revert", partial.id.to_string())));
        assert!(calls.contains(&("settle", validated.id.to_string())));
        assert!(calls.contains(&("refund", stuck.gateway_id.clone())));
        assert_eq!(calls.len(), 4);
    }

    #[tokio::test]
    async fn test_reassign_pending_orders_skips_live_reservations() {
        let s = setup();
        let buckets = fixtures::seed_ngn_market(&s.store, &[(dec!(1000), dec!(100000))]).await;
        fixtures::seed_provider(&s.store, "prov-0", &[buckets[0].id], dec!(1)).await;
        fixtures::seed_provider(&s.store, "prov-1", &[buckets[0].id], dec!(2)).await;
        let token = fixtures::seed_token(&s.store).await;

        let mut orphan = lock_order(&s.store, &token, LockOrderStatus::Pending, Duration::minutes(10)).await;
        orphan.provision_bucket_id = Some(buckets[0].id);
        s.store.insert_lock_order(orphan.clone()).await;
        let mut held = lock_order(&s.store, &token, LockOrderStatus::Pending, Duration::minutes(10)).await;
        held.provision_bucket_id = Some(buckets[0].id);
        s.store.insert_lock_order(held.clone()).await;
        s.cache
            .set_with_ttl(
                &order_request_key(held.id),
                r#"{"amount":"1","token":"USDT","institution":"GTBINGLA","provider_id":"prov-1"}"#,
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(s.jobs.reassign_pending_orders().await.unwrap(), 1);
        assert!(s.cache.get(&order_request_key(orphan.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_denied_order_is_never_reassigned() {
        let s = setup_with_compliance(Some(ComplianceDecision::Deny));
        let buckets = fixtures::seed_ngn_market(&s.store, &[(dec!(1000), dec!(100000))]).await;
        fixtures::seed_token(&s.store).await;
        fixtures::seed_provider(&s.store, "prov-0", &[buckets[0].id], dec!(1)).await;
        s.chain
            .push(ChainEvent::OrderCreated(order_created(22, 50_000_000, 1500, None)));
        s.jobs.index_blockchain_events().await.unwrap();

        let mut order = s.store.lock_orders_by_gateway_id(&gateway_id(22)).await.unwrap().remove(0);
        assert_eq!(order.status, LockOrderStatus::Refunded);
        order.created_at = Utc::now() - Duration::minutes(10);
        order.updated_at = order.created_at;
        s.store.insert_lock_order(order.clone()).await;

        assert_eq!(s.jobs.reassign_pending_orders().await.unwrap(), 0);
        assert!(s.cache.get(&order_request_key(order.id)).await.unwrap().is_none());
        assert_eq!(s.lifecycle.count("refund"), 1);
    }
}
