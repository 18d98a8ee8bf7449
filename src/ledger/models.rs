use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Transport family of a network, decided once from its identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainFamily {
    /// Log filtering over JSON-RPC
    Evm,
    /// Account-model ledger polled over REST
    Rest,
}

impl ChainFamily {
    pub fn from_identifier(identifier: &str) -> Self {
        if identifier.to_ascii_lowercase().starts_with("tron") {
            ChainFamily::Rest
        } else {
            ChainFamily::Evm
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Rest => "tron",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ========== STATUS ENUMS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_order_status", rename_all = "lowercase")]
pub enum PaymentOrderStatus {
    Initiated,
    Pending,
    Expired,
    Settled,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "lock_order_status", rename_all = "lowercase")]
pub enum LockOrderStatus {
    Pending,
    Validated,
    Settled,
    Refunded,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "receive_address_status", rename_all = "lowercase")]
pub enum ReceiveAddressStatus {
    Unused,
    Partial,
    Used,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "validation_status", rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "provider_visibility", rename_all = "lowercase")]
pub enum VisibilityMode {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "availability_cadence", rename_all = "lowercase")]
pub enum AvailabilityCadence {
    Always,
    Weekdays,
    Weekends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "conversion_rate_type", rename_all = "lowercase")]
pub enum ConversionRateType {
    Fixed,
    Floating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
pub enum TransactionStatus {
    CryptoDeposited,
    OrderCreated,
    OrderSettled,
    OrderRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "webhook_attempt_status", rename_all = "lowercase")]
pub enum WebhookAttemptStatus {
    Failed,
    Success,
    Expired,
}

// ========== REFERENCE ENTITIES ==========

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Network {
    pub id: Uuid,
    /// e.g. `base`, `arbitrum-one`, `tron-shasta`
    pub identifier: String,
    pub chain_id: i64,
    pub rpc_endpoint: String,
    pub gateway_contract_address: String,
    pub is_testnet: bool,
    pub fee: Decimal,
}

impl Network {
    pub fn family(&self) -> ChainFamily {
        ChainFamily::from_identifier(&self.identifier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Token {
    pub id: Uuid,
    pub symbol: String,
    pub contract_address: String,
    pub decimals: i32,
    /// Identifier of the owning network
    pub network: String,
    pub is_enabled: bool,
}

impl Token {
    pub fn scale(&self) -> u32 {
        self.decimals.max(0) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FiatCurrency {
    pub id: Uuid,
    pub code: String,
    pub short_name: String,
    pub decimals: i32,
    pub market_rate: Decimal,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Institution {
    pub code: String,
    pub name: String,
    pub currency_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SenderProfile {
    pub id: Uuid,
    pub webhook_url: Option<String>,
    pub webhook_secret: String,
}

// ========== ORDERS ==========

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReceiveAddress {
    pub id: Uuid,
    pub address: String,
    pub status: ReceiveAddressStatus,
    pub tx_hash: Option<String>,
    pub last_indexed_block: Option<i64>,
    pub last_used: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Decrypted or submitted beneficiary details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Recipient {
    pub institution: String,
    pub account_identifier: String,
    pub account_name: String,
    pub memo: Option<String>,
    pub provider_id: Option<String>,
}

impl Recipient {
    /// Memo prefix marking a peer-to-peer order that settles whatever arrives
    pub const P2P_MEMO_PREFIX: &'static str = "P#P";

    pub fn is_p2p(&self) -> bool {
        self.provider_id.is_some()
            && self
                .memo
                .as_deref()
                .is_some_and(|memo| memo.starts_with(Self::P2P_MEMO_PREFIX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentOrder {
    pub id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_paid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_returned: Decimal,
    pub percent_settled: Decimal,
    pub protocol_fee: Decimal,
    pub sender_fee: Decimal,
    pub network_fee: Decimal,
    pub rate: Decimal,
    pub status: PaymentOrderStatus,
    pub gateway_id: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: i64,
    pub from_address: Option<String>,
    pub return_address: Option<String>,
    pub receive_address_id: Option<Uuid>,
    pub token_id: Uuid,
    pub sender_profile_id: Option<Uuid>,
    #[sqlx(flatten)]
    pub recipient: Recipient,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    /// Amount the receive address must collect, rounded to the token's precision
    pub fn expected_amount(&self, token_decimals: u32) -> Decimal {
        (self.amount + self.protocol_fee + self.sender_fee + self.network_fee)
            .round_dp(token_decimals)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LockPaymentOrder {
    pub id: Uuid,
    pub gateway_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub rate: Decimal,
    pub order_percent: Decimal,
    pub tx_hash: String,
    pub status: LockOrderStatus,
    pub block_number: i64,
    pub token_id: Uuid,
    pub network: String,
    pub institution: String,
    pub account_identifier: String,
    pub account_name: String,
    pub memo: Option<String>,
    pub provider_id: Option<String>,
    pub provision_bucket_id: Option<Uuid>,
    pub cancellation_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockPaymentOrder {
    pub fn fiat_amount(&self) -> Decimal {
        self.amount * self.rate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LockOrderFulfillment {
    pub id: Uuid,
    pub lock_order_id: Uuid,
    pub tx_id: Option<String>,
    pub validation_status: ValidationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== PROVIDERS ==========

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProvisionBucket {
    pub id: Uuid,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub currency_code: String,
}

impl ProvisionBucket {
    pub fn contains(&self, fiat_amount: Decimal) -> bool {
        self.min_amount <= fiat_amount && fiat_amount <= self.max_amount
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAvailability {
    pub cadence: AvailabilityCadence,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ProviderAvailability {
    /// Always-on providers, or windows that stay open until at least `horizon`
    pub fn is_available_until(&self, horizon: DateTime<Utc>) -> bool {
        match self.cadence {
            AvailabilityCadence::Always => true,
            _ => self.end_time.is_some_and(|end| end >= horizon),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderOrderToken {
    pub symbol: String,
    pub conversion_rate_type: ConversionRateType,
    pub fixed_conversion_rate: Decimal,
    pub floating_conversion_rate: Decimal,
    pub max_order_amount: Decimal,
    pub min_order_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub trading_name: String,
    pub currency_code: String,
    pub visibility: VisibilityMode,
    pub is_active: bool,
    pub availability: ProviderAvailability,
    /// Derived from the provider's rating history
    pub trust_score: Decimal,
    pub bucket_ids: Vec<Uuid>,
    pub order_tokens: Vec<ProviderOrderToken>,
}

impl ProviderProfile {
    pub fn order_token(&self, symbol: &str) -> Option<&ProviderOrderToken> {
        self.order_tokens
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }
}

// ========== AUDIT & NOTIFICATIONS ==========

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransactionLog {
    pub id: Uuid,
    pub gateway_id: Option<String>,
    pub status: TransactionStatus,
    pub network: String,
    pub tx_hash: String,
    pub metadata: serde_json::Value,
    pub payment_order_id: Option<Uuid>,
    pub lock_order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookRetryAttempt {
    pub id: Uuid,
    pub attempt_number: i32,
    pub next_retry_time: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub signature: String,
    pub webhook_url: String,
    pub status: WebhookAttemptStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_family_from_identifier() {
        assert_eq!(ChainFamily::from_identifier("tron-shasta"), ChainFamily::Rest);
        assert_eq!(ChainFamily::from_identifier("Tron"), ChainFamily::Rest);
        assert_eq!(ChainFamily::from_identifier("base"), ChainFamily::Evm);
        assert_eq!(ChainFamily::from_identifier("arbitrum-one"), ChainFamily::Evm);
    }

    #[test]
    fn test_p2p_requires_memo_and_provider() {
        let mut recipient = Recipient {
            memo: Some("P#P transfer".into()),
            ..Default::default()
        };
        assert!(!recipient.is_p2p());

        recipient.provider_id = Some("prov-1".into());
        assert!(recipient.is_p2p());

        recipient.memo = Some("rent".into());
        assert!(!recipient.is_p2p());
    }

    #[test]
    fn test_availability_horizon() {
        let now = Utc::now();
        let horizon = now + Duration::hours(1);
        let always = ProviderAvailability {
            cadence: AvailabilityCadence::Always,
            start_time: None,
            end_time: None,
        };
        let closing_soon = ProviderAvailability {
            cadence: AvailabilityCadence::Weekdays,
            start_time: None,
            end_time: Some(now + Duration::minutes(20)),
        };
        let open_late = ProviderAvailability {
            cadence: AvailabilityCadence::Weekdays,
            start_time: None,
            end_time: Some(now + Duration::hours(3)),
        };

        assert!(always.is_available_until(horizon));
        assert!(!closing_soon.is_available_until(horizon));
        assert!(open_late.is_available_until(horizon));
    }

    #[test]
    fn test_bucket_bounds_are_inclusive() {
        let bucket = ProvisionBucket {
            id: Uuid::new_v4(),
            min_amount: dec!(1000),
            max_amount: dec!(100000),
            currency_code: "NGN".into(),
        };
        assert!(bucket.contains(dec!(1000)));
        assert!(bucket.contains(dec!(100000)));
        assert!(!bucket.contains(dec!(100000.01)));
    }
}
