use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::AppResult;

#[derive(Default)]
struct MemoryState {
    networks: Vec<Network>,
    tokens: HashMap<Uuid, Token>,
    currencies: HashMap<String, FiatCurrency>,
    institutions: HashMap<String, Institution>,
    senders: HashMap<Uuid, SenderProfile>,
    payment_orders: HashMap<Uuid, PaymentOrder>,
    receive_addresses: HashMap<Uuid, ReceiveAddress>,
    lock_orders: HashMap<Uuid, LockPaymentOrder>,
    fulfillments: Vec<LockOrderFulfillment>,
    buckets: HashMap<Uuid, ProvisionBucket>,
    providers: HashMap<String, ProviderProfile>,
    logs: Vec<TransactionLog>,
    webhook_attempts: HashMap<Uuid, WebhookRetryAttempt>,
}

impl MemoryState {
    fn address_of(&self, order: &PaymentOrder) -> Option<&ReceiveAddress> {
        order
            .receive_address_id
            .and_then(|id| self.receive_addresses.get(&id))
    }

    fn token_decimals(&self, order: &PaymentOrder) -> u32 {
        self.tokens
            .get(&order.token_id)
            .map(Token::scale)
            .unwrap_or(18)
    }

    fn is_fully_paid(&self, order: &PaymentOrder) -> bool {
        order.amount_paid >= order.expected_amount(self.token_decimals(order))
    }

    fn parent_is_pending(&self, lock: &LockPaymentOrder) -> bool {
        self.payment_orders.values().any(|order| {
            order.gateway_id.as_deref() == Some(lock.gateway_id.as_str())
                && order.status == PaymentOrderStatus::Pending
        })
    }

    fn fulfillment_succeeded(&self, lock_order_id: Uuid) -> bool {
        self.fulfillments.iter().any(|f| {
            f.lock_order_id == lock_order_id && f.validation_status == ValidationStatus::Success
        })
    }

    fn push_log(
        &mut self,
        status: TransactionStatus,
        network: &str,
        tx_hash: &str,
        gateway_id: Option<String>,
        metadata: serde_json::Value,
        payment_order_id: Option<Uuid>,
        lock_order_id: Option<Uuid>,
    ) {
        self.logs.push(TransactionLog {
            id: Uuid::new_v4(),
            gateway_id,
            status,
            network: network.to_string(),
            tx_hash: tx_hash.to_string(),
            metadata,
            payment_order_id,
            lock_order_id,
            created_at: Utc::now(),
        });
    }
}

/// Order store held in process memory.
///
/// A single write lock covers each unit of work, so every mutation is
/// applied all-or-nothing the same way the Postgres store's transactions are.
#[derive(Clone, Default)]
pub struct MemoryOrderStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== SEEDING ==========

    pub async fn insert_network(&self, network: Network) {
        self.state.write().await.networks.push(network);
    }

    pub async fn insert_token(&self, token: Token) {
        self.state.write().await.tokens.insert(token.id, token);
    }

    pub async fn insert_fiat_currency(&self, currency: FiatCurrency) {
        self.state
            .write()
            .await
            .currencies
            .insert(currency.code.clone(), currency);
    }

    pub async fn insert_institution(&self, institution: Institution) {
        self.state
            .write()
            .await
            .institutions
            .insert(institution.code.clone(), institution);
    }

    pub async fn insert_sender_profile(&self, sender: SenderProfile) {
        self.state.write().await.senders.insert(sender.id, sender);
    }

    pub async fn insert_receive_address(&self, address: ReceiveAddress) {
        self.state
            .write()
            .await
            .receive_addresses
            .insert(address.id, address);
    }

    pub async fn insert_payment_order(&self, order: PaymentOrder) {
        self.state
            .write()
            .await
            .payment_orders
            .insert(order.id, order);
    }

    pub async fn insert_lock_order(&self, order: LockPaymentOrder) {
        self.state.write().await.lock_orders.insert(order.id, order);
    }

    pub async fn insert_fulfillment(&self, fulfillment: LockOrderFulfillment) {
        self.state.write().await.fulfillments.push(fulfillment);
    }

    pub async fn insert_bucket(&self, bucket: ProvisionBucket) {
        self.state.write().await.buckets.insert(bucket.id, bucket);
    }

    pub async fn insert_provider(&self, provider: ProviderProfile) {
        self.state
            .write()
            .await
            .providers
            .insert(provider.id.clone(), provider);
    }

    pub async fn transaction_logs(&self) -> Vec<TransactionLog> {
        self.state.read().await.logs.clone()
    }

    pub async fn webhook_attempts(&self) -> Vec<WebhookRetryAttempt> {
        self.state
            .read()
            .await
            .webhook_attempts
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    // ========== REFERENCE DATA ==========

    async fn networks(&self) -> AppResult<Vec<Network>> {
        Ok(self.state.read().await.networks.clone())
    }

    async fn token(&self, id: Uuid) -> AppResult<Option<Token>> {
        Ok(self.state.read().await.tokens.get(&id).cloned())
    }

    async fn token_by_address(&self, network: &str, contract: &str) -> AppResult<Option<Token>> {
        Ok(self
            .state
            .read()
            .await
            .tokens
            .values()
            .find(|t| t.network == network && t.contract_address.eq_ignore_ascii_case(contract))
            .cloned())
    }

    async fn fiat_currency(&self, code: &str) -> AppResult<Option<FiatCurrency>> {
        Ok(self.state.read().await.currencies.get(code).cloned())
    }

    async fn enabled_fiat_currencies(&self) -> AppResult<Vec<FiatCurrency>> {
        Ok(self
            .state
            .read()
            .await
            .currencies
            .values()
            .filter(|c| c.is_enabled)
            .cloned()
            .collect())
    }

    async fn institution(&self, code: &str) -> AppResult<Option<Institution>> {
        Ok(self.state.read().await.institutions.get(code).cloned())
    }

    async fn sender_profile(&self, id: Uuid) -> AppResult<Option<SenderProfile>> {
        Ok(self.state.read().await.senders.get(&id).cloned())
    }

    // ========== ORDER LOOKUPS ==========

    async fn payment_order(&self, id: Uuid) -> AppResult<Option<PaymentOrder>> {
        Ok(self.state.read().await.payment_orders.get(&id).cloned())
    }

    async fn payment_order_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> AppResult<Option<PaymentOrder>> {
        Ok(self
            .state
            .read()
            .await
            .payment_orders
            .values()
            .find(|o| o.gateway_id.as_deref() == Some(gateway_id))
            .cloned())
    }

    async fn receive_address(&self, id: Uuid) -> AppResult<Option<ReceiveAddress>> {
        Ok(self.state.read().await.receive_addresses.get(&id).cloned())
    }

    async fn lock_order(&self, id: Uuid) -> AppResult<Option<LockPaymentOrder>> {
        Ok(self.state.read().await.lock_orders.get(&id).cloned())
    }

    async fn lock_orders_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        Ok(self
            .state
            .read()
            .await
            .lock_orders
            .values()
            .filter(|o| o.gateway_id == gateway_id)
            .cloned()
            .collect())
    }

    async fn lock_order_exists(&self, tx_hash: &str, gateway_id: &str) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .lock_orders
            .values()
            .any(|o| o.tx_hash == tx_hash || o.gateway_id == gateway_id))
    }

    // ========== PROVIDERS ==========

    async fn provision_bucket(&self, id: Uuid) -> AppResult<Option<ProvisionBucket>> {
        Ok(self.state.read().await.buckets.get(&id).cloned())
    }

    async fn provision_buckets(&self, currency_code: &str) -> AppResult<Vec<ProvisionBucket>> {
        Ok(self
            .state
            .read()
            .await
            .buckets
            .values()
            .filter(|b| b.currency_code == currency_code)
            .cloned()
            .collect())
    }

    async fn all_provision_buckets(&self) -> AppResult<Vec<ProvisionBucket>> {
        Ok(self.state.read().await.buckets.values().cloned().collect())
    }

    async fn provider(&self, id: &str) -> AppResult<Option<ProviderProfile>> {
        Ok(self.state.read().await.providers.get(id).cloned())
    }

    async fn bucket_providers(&self, bucket_id: Uuid) -> AppResult<Vec<ProviderProfile>> {
        Ok(self
            .state
            .read()
            .await
            .providers
            .values()
            .filter(|p| {
                p.is_active
                    && p.visibility == VisibilityMode::Public
                    && p.bucket_ids.contains(&bucket_id)
            })
            .cloned()
            .collect())
    }

    async fn currency_providers(&self, currency_code: &str) -> AppResult<Vec<ProviderProfile>> {
        Ok(self
            .state
            .read()
            .await
            .providers
            .values()
            .filter(|p| p.is_active && p.currency_code == currency_code)
            .cloned()
            .collect())
    }

    // ========== RECONCILIATION QUERIES ==========

    async fn orders_awaiting_deposit(&self, network: &str) -> AppResult<Vec<PaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .payment_orders
            .values()
            .filter(|o| o.status == PaymentOrderStatus::Initiated)
            .filter(|o| {
                state
                    .tokens
                    .get(&o.token_id)
                    .is_some_and(|t| t.network == network)
            })
            .filter(|o| {
                state.address_of(o).is_some_and(|a| {
                    matches!(
                        a.status,
                        ReceiveAddressStatus::Unused | ReceiveAddressStatus::Partial
                    )
                })
            })
            .cloned()
            .collect())
    }

    async fn orders_pending_creation(
        &self,
        updated_since: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .payment_orders
            .values()
            .filter(|o| {
                o.status == PaymentOrderStatus::Initiated
                    && o.gateway_id.is_none()
                    && o.updated_at >= updated_since
                    && state.is_fully_paid(o)
                    && state
                        .address_of(o)
                        .is_some_and(|a| a.status == ReceiveAddressStatus::Used)
            })
            .cloned()
            .collect())
    }

    async fn orders_to_revert(&self, updated_before: DateTime<Utc>) -> AppResult<Vec<PaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .payment_orders
            .values()
            .filter(|o| {
                matches!(
                    o.status,
                    PaymentOrderStatus::Initiated | PaymentOrderStatus::Expired
                ) && o.amount_paid > Decimal::ZERO
                    && o.amount_returned == Decimal::ZERO
                    && o.updated_at < updated_before
                    && state.address_of(o).is_some_and(|a| {
                        matches!(
                            a.status,
                            ReceiveAddressStatus::Expired | ReceiveAddressStatus::Used
                        )
                    })
            })
            .cloned()
            .collect())
    }

    async fn orders_with_lapsed_addresses(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .payment_orders
            .values()
            .filter(|o| o.status == PaymentOrderStatus::Initiated)
            .filter(|o| match state.address_of(o) {
                Some(a) => match a.status {
                    ReceiveAddressStatus::Unused | ReceiveAddressStatus::Partial => {
                        a.valid_until.is_some_and(|until| until < now)
                    }
                    ReceiveAddressStatus::Used => {
                        o.amount_paid > o.expected_amount(state.token_decimals(o))
                            && o.amount_returned == Decimal::ZERO
                    }
                    ReceiveAddressStatus::Expired => false,
                },
                None => false,
            })
            .cloned()
            .collect())
    }

    async fn lock_orders_to_settle(
        &self,
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .lock_orders
            .values()
            .filter(|o| {
                o.status == LockOrderStatus::Validated
                    && o.updated_at < updated_before
                    && state.fulfillment_succeeded(o.id)
            })
            .cloned()
            .collect())
    }

    async fn lock_orders_to_refund(
        &self,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .lock_orders
            .values()
            .filter(|o| o.created_at <= created_before)
            .filter(|o| match o.status {
                LockOrderStatus::Pending | LockOrderStatus::Cancelled => true,
                LockOrderStatus::Validated => !state.fulfillment_succeeded(o.id),
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn lock_orders_awaiting_settlement_event(
        &self,
        network: &str,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .lock_orders
            .values()
            .filter(|o| o.network == network)
            .filter(|o| match o.status {
                LockOrderStatus::Validated => true,
                LockOrderStatus::Settled => state.parent_is_pending(o),
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn lock_orders_awaiting_refund_event(
        &self,
        network: &str,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let state = self.state.read().await;
        Ok(state
            .lock_orders
            .values()
            .filter(|o| o.network == network)
            .filter(|o| match o.status {
                LockOrderStatus::Pending => o.created_at <= created_before,
                LockOrderStatus::Refunded => state.parent_is_pending(o),
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn pending_lock_orders(
        &self,
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        Ok(self
            .state
            .read()
            .await
            .lock_orders
            .values()
            .filter(|o| o.status == LockOrderStatus::Pending && o.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn due_webhook_attempts(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<WebhookRetryAttempt>> {
        Ok(self
            .state
            .read()
            .await
            .webhook_attempts
            .values()
            .filter(|a| a.status == WebhookAttemptStatus::Failed && a.next_retry_time <= now)
            .cloned()
            .collect())
    }

    // ========== UNITS OF WORK ==========

    async fn record_deposit(&self, deposit: DepositRecord) -> AppResult<Option<PaymentOrder>> {
        let mut state = self.state.write().await;

        let seen = state.logs.iter().any(|log| {
            log.status == TransactionStatus::CryptoDeposited && log.tx_hash == deposit.tx_hash
        });
        if seen || !state.payment_orders.contains_key(&deposit.order_id) {
            debug!("Deposit {} already recorded", deposit.tx_hash);
            return Ok(None);
        }

        let now = Utc::now();
        if let Some(address) = state.receive_addresses.get_mut(&deposit.receive_address_id) {
            address.status = deposit.address_status;
            address.tx_hash = Some(deposit.tx_hash.clone());
            address.last_used = Some(now);
            address.last_indexed_block = Some(deposit.block_number);
        }

        let updated = match state.payment_orders.get_mut(&deposit.order_id) {
            Some(order) => {
                order.amount_paid += deposit.value;
                order.from_address = Some(deposit.from_address.clone());
                if order.return_address.is_none() {
                    order.return_address = Some(deposit.from_address.clone());
                }
                order.tx_hash = Some(deposit.tx_hash.clone());
                order.block_number = deposit.block_number;
                if let Some(amount) = deposit.amount_override {
                    order.amount = amount;
                }
                if let Some(rate) = deposit.rate_override {
                    order.rate = rate;
                }
                order.updated_at = now;
                order.clone()
            }
            None => return Ok(None),
        };

        state.push_log(
            TransactionStatus::CryptoDeposited,
            &deposit.network,
            &deposit.tx_hash,
            None,
            serde_json::json!({
                "from": deposit.from_address,
                "value": deposit.value.to_string(),
                "block_number": deposit.block_number,
            }),
            Some(deposit.order_id),
            None,
        );

        Ok(Some(updated))
    }

    async fn create_lock_orders(
        &self,
        orders: Vec<NewLockOrder>,
        log: OrderCreatedLog,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let mut state = self.state.write().await;

        let duplicate = state
            .lock_orders
            .values()
            .any(|o| o.tx_hash == log.tx_hash || o.gateway_id == log.gateway_id);
        if duplicate || orders.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let created: Vec<LockPaymentOrder> =
            orders.into_iter().map(|o| o.into_lock_order(now)).collect();
        for order in &created {
            state.lock_orders.insert(order.id, order.clone());
        }

        let mut payment_order_id = None;
        if let Some(parent) = state
            .payment_orders
            .values_mut()
            .find(|o| o.tx_hash.as_deref() == Some(log.tx_hash.as_str()) && o.gateway_id.is_none())
        {
            parent.gateway_id = Some(log.gateway_id.clone());
            parent.block_number = log.block_number;
            parent.status = PaymentOrderStatus::Pending;
            parent.updated_at = now;
            payment_order_id = Some(parent.id);
        }

        state.push_log(
            TransactionStatus::OrderCreated,
            &log.network,
            &log.tx_hash,
            Some(log.gateway_id.clone()),
            log.metadata.clone(),
            payment_order_id,
            created.first().map(|o| o.id),
        );

        Ok(created)
    }

    async fn apply_order_settled(&self, update: SettlementUpdate) -> AppResult<SettlementOutcome> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let lock_id = match state.lock_orders.get_mut(&update.split_order_id) {
            Some(lock) if lock.status != LockOrderStatus::Settled => {
                lock.status = LockOrderStatus::Settled;
                lock.updated_at = now;
                lock.id
            }
            _ => return Ok(SettlementOutcome::default()),
        };

        let mut payment_order = None;
        if let Some(parent) = state
            .payment_orders
            .values_mut()
            .find(|o| o.gateway_id.as_deref() == Some(update.gateway_id.as_str()))
        {
            if parent.status != PaymentOrderStatus::Settled {
                parent.percent_settled = (parent.percent_settled + update.settle_percent).min(dec!(100));
                if parent.percent_settled >= dec!(100) {
                    parent.status = PaymentOrderStatus::Settled;
                }
                parent.updated_at = now;
            }
            payment_order = Some(parent.clone());
        }

        let parent_id = payment_order.as_ref().map(|o| o.id);
        let existing = state.logs.iter_mut().find(|log| {
            log.status == TransactionStatus::OrderSettled
                && log.gateway_id.as_deref() == Some(update.gateway_id.as_str())
        });
        match existing {
            Some(log) => {
                log.tx_hash = update.tx_hash.clone();
                log.lock_order_id = Some(lock_id);
            }
            None => state.push_log(
                TransactionStatus::OrderSettled,
                &update.network,
                &update.tx_hash,
                Some(update.gateway_id.clone()),
                serde_json::json!({
                    "liquidity_provider": update.liquidity_provider,
                    "settle_percent": update.settle_percent.to_string(),
                    "block_number": update.block_number,
                }),
                parent_id,
                Some(lock_id),
            ),
        }

        Ok(SettlementOutcome {
            applied: true,
            payment_order,
        })
    }

    async fn apply_order_refunded(&self, update: RefundUpdate) -> AppResult<Option<PaymentOrder>> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let mut changed = false;
        let mut lock_id = None;
        for lock in state
            .lock_orders
            .values_mut()
            .filter(|o| o.gateway_id == update.gateway_id)
        {
            lock_id.get_or_insert(lock.id);
            if lock.status != LockOrderStatus::Refunded {
                lock.status = LockOrderStatus::Refunded;
                lock.updated_at = now;
                changed = true;
            }
        }

        let mut payment_order = None;
        if let Some(parent) = state
            .payment_orders
            .values_mut()
            .find(|o| o.gateway_id.as_deref() == Some(update.gateway_id.as_str()))
        {
            if !matches!(
                parent.status,
                PaymentOrderStatus::Refunded | PaymentOrderStatus::Settled
            ) {
                parent.status = PaymentOrderStatus::Refunded;
                parent.updated_at = now;
                changed = true;
                payment_order = Some(parent.clone());
            }
        }

        if changed {
            let parent_id = payment_order.as_ref().map(|o| o.id);
            state.push_log(
                TransactionStatus::OrderRefunded,
                &update.network,
                &update.tx_hash,
                Some(update.gateway_id.clone()),
                serde_json::json!({
                    "fee": update.fee.to_string(),
                    "block_number": update.block_number,
                }),
                parent_id,
                lock_id,
            );
        }

        Ok(payment_order)
    }

    async fn expire_order(&self, order_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let address_id = match state.payment_orders.get_mut(&order_id) {
            Some(order) if order.status == PaymentOrderStatus::Initiated => {
                order.status = PaymentOrderStatus::Expired;
                order.updated_at = now;
                order.receive_address_id
            }
            _ => return Ok(false),
        };
        if let Some(address) = address_id.and_then(|id| state.receive_addresses.get_mut(&id)) {
            address.status = ReceiveAddressStatus::Expired;
        }
        Ok(true)
    }

    async fn extend_receive_address(
        &self,
        address_id: Uuid,
        valid_until: DateTime<Utc>,
    ) -> AppResult<()> {
        if let Some(address) = self
            .state
            .write()
            .await
            .receive_addresses
            .get_mut(&address_id)
        {
            address.valid_until = Some(valid_until);
        }
        Ok(())
    }

    async fn insert_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()> {
        self.state
            .write()
            .await
            .webhook_attempts
            .insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn update_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()> {
        self.insert_webhook_attempt(attempt).await
    }

    async fn set_fiat_market_rate(&self, code: &str, rate: Decimal) -> AppResult<()> {
        if let Some(currency) = self.state.write().await.currencies.get_mut(code) {
            currency.market_rate = rate;
        }
        Ok(())
    }
}
