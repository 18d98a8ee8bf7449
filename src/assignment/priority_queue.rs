use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cache::{AssignmentCache, KeyEvent};
use crate::config::OrderConfig;
use crate::error::{AppResult, AssignmentError, OrderError};
use crate::ledger::models::{
    ConversionRateType, FiatCurrency, LockOrderStatus, LockPaymentOrder, ProviderProfile,
    ProvisionBucket,
};
use crate::ledger::OrderStore;

const ORDER_REQUEST_PREFIX: &str = "order_request_";

pub fn bucket_key(bucket_id: Uuid) -> String {
    format!("bucket_{}", bucket_id)
}

pub fn order_request_key(order_id: Uuid) -> String {
    format!("{}{}", ORDER_REQUEST_PREFIX, order_id)
}

pub fn exclude_list_key(order_id: Uuid) -> String {
    format!("order_exclude_list_{}", order_id)
}

/// Reservation offered to a provider while it decides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Fiat amount: crypto amount times rate
    pub amount: Decimal,
    pub token: String,
    pub institution: String,
    pub provider_id: String,
}

/// Ranked provider pools per provision bucket, and reservation of
/// providers for lock orders.
pub struct PriorityQueueService {
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn AssignmentCache>,
    config: OrderConfig,
}

impl PriorityQueueService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn AssignmentCache>,
        config: OrderConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    // ========== POOL CONSTRUCTION ==========

    /// Rebuild every bucket's pool, buckets in parallel
    pub async fn process_bucket_queues(&self) -> AppResult<usize> {
        let buckets = self.store.all_provision_buckets().await?;
        let results = join_all(
            buckets
                .iter()
                .map(|bucket| self.create_priority_queue_for_bucket(bucket)),
        )
        .await;

        let mut rebuilt = 0;
        for (bucket, result) in buckets.iter().zip(results) {
            match result {
                Ok(size) => {
                    rebuilt += 1;
                    debug!("Bucket {} queue has {} providers", bucket.id, size);
                }
                Err(e) => error!("❌ Failed to rebuild queue for bucket {}: {:?}", bucket.id, e),
            }
        }
        info!("✅ Rebuilt {}/{} bucket queues", rebuilt, buckets.len());
        Ok(rebuilt)
    }

    /// Rank the bucket's currently available providers by trust score
    pub async fn create_priority_queue_for_bucket(&self, bucket: &ProvisionBucket) -> AppResult<usize> {
        let horizon = Utc::now() + ChronoDuration::minutes(self.config.bucket_availability_horizon_mins);
        let members: Vec<(String, f64)> = self
            .store
            .bucket_providers(bucket.id)
            .await?
            .into_iter()
            .filter(|p| p.availability.is_available_until(horizon))
            .map(|p| {
                let score = p.trust_score.to_f64().unwrap_or_default();
                (p.id, score)
            })
            .collect();

        self.cache
            .ranked_set_replace(&bucket_key(bucket.id), members)
            .await
    }

    // ========== RESERVATION ==========

    /// Reserve the best eligible provider for `order` and return its id
    #[instrument(skip(self, order), fields(order_id = %order.id, gateway_id = %order.gateway_id))]
    pub async fn assign_lock_payment_order(&self, order: &LockPaymentOrder) -> AppResult<String> {
        let excluded = self.cache.list_range(&exclude_list_key(order.id)).await?;

        if let Some(provider_id) = order.provider_id.as_ref().filter(|p| !excluded.contains(p)) {
            self.reserve(order, provider_id).await?;
            info!("🎯 Order {} reserved for requested provider {}", order.id, provider_id);
            return Ok(provider_id.clone());
        }

        let bucket_id = order
            .provision_bucket_id
            .ok_or(AssignmentError::NoProvisionBucket(order.id))?;
        let key = bucket_key(bucket_id);
        let claim_ttl = self.config.order_request_validity();

        let popped = match self.cache.ranked_set_pop_highest(&key, &excluded, claim_ttl).await? {
            Some(popped) => popped,
            None => {
                self.rebuild_bucket(bucket_id).await?;
                self.cache
                    .ranked_set_pop_highest(&key, &excluded, claim_ttl)
                    .await?
                    .ok_or(AssignmentError::NoProvidersAvailable { bucket_id })?
            }
        };

        if let Err(e) = self.reserve(order, &popped.member).await {
            self.cache
                .ranked_set_release(&key, &popped.member, popped.score)
                .await?;
            return Err(e);
        }

        if popped.remaining == 0 {
            if let Err(e) = self.rebuild_bucket(bucket_id).await {
                warn!("⚠️  Bucket {} emptied and rebuild failed: {:?}", bucket_id, e);
            }
        }

        info!("✅ Order {} reserved for provider {}", order.id, popped.member);
        Ok(popped.member)
    }

    async fn rebuild_bucket(&self, bucket_id: Uuid) -> AppResult<usize> {
        let bucket = self
            .store
            .provision_bucket(bucket_id)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("provision bucket {}", bucket_id)))?;
        self.create_priority_queue_for_bucket(&bucket).await
    }

    async fn reserve(&self, order: &LockPaymentOrder, provider_id: &str) -> AppResult<()> {
        let token = self
            .store
            .token(order.token_id)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("token {}", order.token_id)))?;

        let request = OrderRequest {
            amount: order.fiat_amount(),
            token: token.symbol,
            institution: order.institution.clone(),
            provider_id: provider_id.to_string(),
        };
        self.cache
            .set_with_ttl(
                &order_request_key(order.id),
                &serde_json::to_string(&request)?,
                self.config.order_request_validity(),
            )
            .await
    }

    pub async fn has_live_reservation(&self, order_id: Uuid) -> AppResult<bool> {
        Ok(self.cache.get(&order_request_key(order_id)).await?.is_some())
    }

    /// Rate the provider quotes for `token_symbol` in `currency`
    pub fn get_provider_rate(
        &self,
        provider: &ProviderProfile,
        token_symbol: &str,
        currency: &FiatCurrency,
    ) -> AppResult<Decimal> {
        let token = provider
            .order_token(token_symbol)
            .ok_or_else(|| AssignmentError::NoProviderRate {
                provider_id: provider.id.clone(),
                token: token_symbol.to_string(),
            })?;

        let rate = match token.conversion_rate_type {
            ConversionRateType::Fixed => token.fixed_conversion_rate,
            ConversionRateType::Floating => currency.market_rate + token.floating_conversion_rate,
        };
        Ok(rate.round_dp(2))
    }

    // ========== REASSIGNMENT ==========

    /// React to a reservation that expired or was cancelled
    pub async fn handle_reservation_event(&self, event: &KeyEvent) -> AppResult<()> {
        let Some(order_id) = event
            .key
            .strip_prefix(ORDER_REQUEST_PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(());
        };

        if let Ok(previous) = serde_json::from_str::<OrderRequest>(&event.value) {
            self.cache
                .list_push(
                    &exclude_list_key(order_id),
                    &previous.provider_id,
                    self.config.exclude_list_ttl(),
                )
                .await?;
        }

        let Some(order) = self.store.lock_order(order_id).await? else {
            warn!("⚠️  Reservation for unknown lock order {}", order_id);
            return Ok(());
        };
        if order.status != LockOrderStatus::Pending {
            debug!("Order {} is {:?}, not reassigning", order_id, order.status);
            return Ok(());
        }

        info!("🔄 Reassigning order {} after {:?}", order_id, event.kind);
        self.assign_lock_payment_order(&order).await.map(|_| ())
    }

    /// Single worker consuming reservation expiry events
    pub fn start_reassignment_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut events = BroadcastStream::new(self.cache.subscribe());

        tokio::spawn(async move {
            info!("👂 Reassignment worker listening for expired reservations");
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if let Err(e) = service.handle_reservation_event(&event).await {
                            error!("❌ Reassignment for {} failed: {}", event.key, e);
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!("⚠️  Reassignment worker missed {} events", missed);
                    }
                }
            }
        })
    }
}
