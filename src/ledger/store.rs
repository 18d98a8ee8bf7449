use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Transfer observed on a receive address, applied as one unit of work
#[derive(Debug, Clone)]
pub struct DepositRecord {
    pub order_id: Uuid,
    pub receive_address_id: Uuid,
    pub network: String,
    pub tx_hash: String,
    pub from_address: String,
    pub value: Decimal,
    pub block_number: i64,
    pub address_status: ReceiveAddressStatus,
    /// Peer-to-peer orders take whatever arrived as the new order amount
    pub amount_override: Option<Decimal>,
    pub rate_override: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewLockOrder {
    pub gateway_id: String,
    pub amount: Decimal,
    pub rate: Decimal,
    pub order_percent: Decimal,
    pub tx_hash: String,
    pub block_number: i64,
    pub token_id: Uuid,
    pub network: String,
    pub recipient: Recipient,
    pub provision_bucket_id: Option<Uuid>,
    pub status: LockOrderStatus,
}

impl NewLockOrder {
    pub fn into_lock_order(self, now: DateTime<Utc>) -> LockPaymentOrder {
        LockPaymentOrder {
            id: Uuid::new_v4(),
            gateway_id: self.gateway_id,
            amount: self.amount,
            rate: self.rate,
            order_percent: self.order_percent,
            tx_hash: self.tx_hash,
            status: self.status,
            block_number: self.block_number,
            token_id: self.token_id,
            network: self.network,
            institution: self.recipient.institution,
            account_identifier: self.recipient.account_identifier,
            account_name: self.recipient.account_name,
            memo: self.recipient.memo,
            provider_id: self.recipient.provider_id,
            provision_bucket_id: self.provision_bucket_id,
            cancellation_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Audit entry written alongside newly created lock orders
#[derive(Debug, Clone)]
pub struct OrderCreatedLog {
    pub network: String,
    pub tx_hash: String,
    pub gateway_id: String,
    pub block_number: i64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SettlementUpdate {
    pub gateway_id: String,
    pub split_order_id: Uuid,
    pub network: String,
    pub tx_hash: String,
    pub block_number: i64,
    pub liquidity_provider: String,
    /// Share of the parent order settled by this event, 0-100
    pub settle_percent: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct SettlementOutcome {
    /// False when the split order was already settled
    pub applied: bool,
    pub payment_order: Option<PaymentOrder>,
}

#[derive(Debug, Clone)]
pub struct RefundUpdate {
    pub gateway_id: String,
    pub network: String,
    pub tx_hash: String,
    pub block_number: i64,
    pub fee: Decimal,
}

/// Authoritative order state. Every write method is a single transaction.
#[async_trait]
pub trait OrderStore: Send + Sync {
    // ========== REFERENCE DATA ==========

    async fn networks(&self) -> AppResult<Vec<Network>>;

    async fn token(&self, id: Uuid) -> AppResult<Option<Token>>;

    async fn token_by_address(&self, network: &str, contract: &str) -> AppResult<Option<Token>>;

    async fn fiat_currency(&self, code: &str) -> AppResult<Option<FiatCurrency>>;

    async fn enabled_fiat_currencies(&self) -> AppResult<Vec<FiatCurrency>>;

    async fn institution(&self, code: &str) -> AppResult<Option<Institution>>;

    async fn sender_profile(&self, id: Uuid) -> AppResult<Option<SenderProfile>>;

    // ========== ORDER LOOKUPS ==========

    async fn payment_order(&self, id: Uuid) -> AppResult<Option<PaymentOrder>>;

    async fn payment_order_by_gateway_id(&self, gateway_id: &str)
        -> AppResult<Option<PaymentOrder>>;

    async fn receive_address(&self, id: Uuid) -> AppResult<Option<ReceiveAddress>>;

    async fn lock_order(&self, id: Uuid) -> AppResult<Option<LockPaymentOrder>>;

    async fn lock_orders_by_gateway_id(&self, gateway_id: &str)
        -> AppResult<Vec<LockPaymentOrder>>;

    async fn lock_order_exists(&self, tx_hash: &str, gateway_id: &str) -> AppResult<bool>;

    // ========== PROVIDERS ==========

    async fn provision_bucket(&self, id: Uuid) -> AppResult<Option<ProvisionBucket>>;

    async fn provision_buckets(&self, currency_code: &str) -> AppResult<Vec<ProvisionBucket>>;

    async fn all_provision_buckets(&self) -> AppResult<Vec<ProvisionBucket>>;

    async fn provider(&self, id: &str) -> AppResult<Option<ProviderProfile>>;

    /// Active, public providers enrolled in the bucket
    async fn bucket_providers(&self, bucket_id: Uuid) -> AppResult<Vec<ProviderProfile>>;

    /// Active providers quoting the currency
    async fn currency_providers(&self, currency_code: &str) -> AppResult<Vec<ProviderProfile>>;

    // ========== RECONCILIATION QUERIES ==========

    /// Initiated orders on the network whose address is still collecting
    async fn orders_awaiting_deposit(&self, network: &str) -> AppResult<Vec<PaymentOrder>>;

    /// Initiated, fully paid, no gateway id, updated at or after `updated_since`
    async fn orders_pending_creation(&self, updated_since: DateTime<Utc>)
        -> AppResult<Vec<PaymentOrder>>;

    /// Initiated or expired, partly paid, address expired or used, idle since `updated_before`
    async fn orders_to_revert(&self, updated_before: DateTime<Utc>)
        -> AppResult<Vec<PaymentOrder>>;

    /// Initiated orders whose address is past its deadline, or used with excess paid
    async fn orders_with_lapsed_addresses(&self, now: DateTime<Utc>)
        -> AppResult<Vec<PaymentOrder>>;

    /// Validated with a successful fulfillment, idle since `updated_before`
    async fn lock_orders_to_settle(&self, updated_before: DateTime<Utc>)
        -> AppResult<Vec<LockPaymentOrder>>;

    /// Pending or cancelled created before `created_before`, or validated
    /// without a successful fulfillment by then
    async fn lock_orders_to_refund(&self, created_before: DateTime<Utc>)
        -> AppResult<Vec<LockPaymentOrder>>;

    /// Validated, or settled while the parent is still pending
    async fn lock_orders_awaiting_settlement_event(&self, network: &str)
        -> AppResult<Vec<LockPaymentOrder>>;

    /// Pending created before `created_before`, or refunded while the parent is still pending
    async fn lock_orders_awaiting_refund_event(
        &self,
        network: &str,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>>;

    async fn pending_lock_orders(&self, updated_before: DateTime<Utc>)
        -> AppResult<Vec<LockPaymentOrder>>;

    async fn due_webhook_attempts(&self, now: DateTime<Utc>)
        -> AppResult<Vec<WebhookRetryAttempt>>;

    // ========== UNITS OF WORK ==========

    /// Returns `None` when the transfer was already recorded
    async fn record_deposit(&self, deposit: DepositRecord) -> AppResult<Option<PaymentOrder>>;

    /// Inserts all orders with one audit log and marks the matching payment
    /// order pending. Returns an empty list when the tx hash or gateway id
    /// is already known.
    async fn create_lock_orders(
        &self,
        orders: Vec<NewLockOrder>,
        log: OrderCreatedLog,
    ) -> AppResult<Vec<LockPaymentOrder>>;

    async fn create_lock_order(
        &self,
        order: NewLockOrder,
        log: OrderCreatedLog,
    ) -> AppResult<Option<LockPaymentOrder>> {
        Ok(self.create_lock_orders(vec![order], log).await?.into_iter().next())
    }

    async fn apply_order_settled(&self, update: SettlementUpdate) -> AppResult<SettlementOutcome>;

    /// Returns the parent payment order when this call changed it
    async fn apply_order_refunded(&self, update: RefundUpdate) -> AppResult<Option<PaymentOrder>>;

    /// Expires the order and its receive address together
    async fn expire_order(&self, order_id: Uuid) -> AppResult<bool>;

    async fn extend_receive_address(&self, address_id: Uuid, valid_until: DateTime<Utc>)
        -> AppResult<()>;

    async fn insert_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()>;

    async fn update_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()>;

    async fn set_fiat_market_rate(&self, code: &str, rate: Decimal) -> AppResult<()>;
}
