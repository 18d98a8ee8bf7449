//! Shared fixtures and fakes for unit tests

pub mod fixtures {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use crate::ledger::models::*;
    use crate::ledger::store::NewLockOrder;
    use crate::ledger::MemoryOrderStore;

    pub const TOKEN_ADDRESS: &str = "0x036cbd53842c5426634e7929541ec2318f3dcf7e";
    pub const GATEWAY_ADDRESS: &str = "0x847dfdaa218f9137229cf8424378871a1da8f625";

    pub fn network(identifier: &str) -> Network {
        Network {
            id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            chain_id: 84532,
            rpc_endpoint: format!("http://{}.rpc.local", identifier),
            gateway_contract_address: GATEWAY_ADDRESS.to_string(),
            is_testnet: true,
            fee: dec!(0.5),
        }
    }

    pub fn currency(code: &str, market_rate: Decimal) -> FiatCurrency {
        FiatCurrency {
            id: Uuid::new_v4(),
            code: code.to_string(),
            short_name: code.to_string(),
            decimals: 2,
            market_rate,
            is_enabled: true,
        }
    }

    pub async fn seed_token(store: &MemoryOrderStore) -> Token {
        let token = Token {
            id: Uuid::new_v4(),
            symbol: "USDT".into(),
            contract_address: TOKEN_ADDRESS.into(),
            decimals: 6,
            network: "base".into(),
            is_enabled: true,
        };
        store.insert_token(token.clone()).await;
        token
    }

    /// Naira currency, one institution and a single bucket per range
    pub async fn seed_ngn_market(store: &MemoryOrderStore, ranges: &[(Decimal, Decimal)]) -> Vec<ProvisionBucket> {
        store.insert_fiat_currency(currency("NGN", dec!(1500))).await;
        store
            .insert_institution(Institution {
                code: "GTBINGLA".into(),
                name: "Guaranty Trust Bank".into(),
                currency_code: "NGN".into(),
            })
            .await;

        let mut buckets = Vec::new();
        for (min, max) in ranges {
            buckets.push(seed_bucket(store, *min, *max).await);
        }
        buckets
    }

    pub async fn seed_bucket(store: &MemoryOrderStore, min: Decimal, max: Decimal) -> ProvisionBucket {
        let bucket = ProvisionBucket {
            id: Uuid::new_v4(),
            min_amount: min,
            max_amount: max,
            currency_code: "NGN".into(),
        };
        store.insert_bucket(bucket.clone()).await;
        bucket
    }

    pub fn provider(id: &str, bucket_ids: &[Uuid], trust_score: Decimal) -> ProviderProfile {
        ProviderProfile {
            id: id.to_string(),
            trading_name: format!("{} Ltd", id),
            currency_code: "NGN".into(),
            visibility: VisibilityMode::Public,
            is_active: true,
            availability: ProviderAvailability {
                cadence: AvailabilityCadence::Always,
                start_time: None,
                end_time: None,
            },
            trust_score,
            bucket_ids: bucket_ids.to_vec(),
            order_tokens: vec![ProviderOrderToken {
                symbol: "USDT".into(),
                conversion_rate_type: ConversionRateType::Fixed,
                fixed_conversion_rate: dec!(1480),
                floating_conversion_rate: Decimal::ZERO,
                max_order_amount: dec!(1000),
                min_order_amount: dec!(1),
            }],
        }
    }

    pub async fn seed_provider(
        store: &MemoryOrderStore,
        id: &str,
        bucket_ids: &[Uuid],
        trust_score: Decimal,
    ) -> ProviderProfile {
        let provider = provider(id, bucket_ids, trust_score);
        store.insert_provider(provider.clone()).await;
        provider
    }

    /// Initiated order with an unused receive address and no fees
    pub async fn seed_payment_order(
        store: &MemoryOrderStore,
        amount: Decimal,
    ) -> (PaymentOrder, ReceiveAddress, Token) {
        let token = seed_token(store).await;
        let now = Utc::now();

        let address = ReceiveAddress {
            id: Uuid::new_v4(),
            address: format!("0x{:0>40}", Uuid::new_v4().simple()),
            status: ReceiveAddressStatus::Unused,
            tx_hash: None,
            last_indexed_block: None,
            last_used: None,
            valid_until: Some(now + Duration::minutes(30)),
        };
        store.insert_receive_address(address.clone()).await;

        let order = PaymentOrder {
            id: Uuid::new_v4(),
            amount,
            amount_paid: Decimal::ZERO,
            amount_returned: Decimal::ZERO,
            percent_settled: Decimal::ZERO,
            protocol_fee: Decimal::ZERO,
            sender_fee: Decimal::ZERO,
            network_fee: Decimal::ZERO,
            rate: dec!(1500),
            status: PaymentOrderStatus::Initiated,
            gateway_id: None,
            tx_hash: None,
            block_number: 0,
            from_address: None,
            return_address: None,
            receive_address_id: Some(address.id),
            token_id: token.id,
            sender_profile_id: None,
            recipient: Recipient {
                institution: "GTBINGLA".into(),
                account_identifier: "0123456789".into(),
                account_name: "Ada Obi".into(),
                memo: None,
                provider_id: None,
            },
            created_at: now,
            updated_at: now,
        };
        store.insert_payment_order(order.clone()).await;

        (order, address, token)
    }

    pub fn new_lock_order(token: &Token, tx_hash: &str, amount: Decimal) -> NewLockOrder {
        NewLockOrder {
            gateway_id: "0xgateway".into(),
            amount,
            rate: dec!(1500),
            order_percent: dec!(100),
            tx_hash: tx_hash.to_string(),
            block_number: 1,
            token_id: token.id,
            network: token.network.clone(),
            recipient: Recipient {
                institution: "GTBINGLA".into(),
                account_identifier: "0123456789".into(),
                account_name: "Ada Obi".into(),
                memo: None,
                provider_id: None,
            },
            provision_bucket_id: None,
            status: LockOrderStatus::Pending,
        }
    }
}

pub mod fakes {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use crate::chain::{in_block_order, ChainClient, ChainEvent, LogQuery};
    use crate::compliance::{ComplianceDecision, ComplianceOracle};
    use crate::error::{AppError, AppResult, ChainError};
    use crate::ledger::models::{LockPaymentOrder, Network, PaymentOrder};
    use crate::lifecycle::OrderLifecycle;
    use crate::reconciliation::rates::PriceFeed;
    use crate::recipient::MessageDecryptor;

    /// Chain serving a fixed set of events
    #[derive(Default)]
    pub struct FakeChainClient {
        pub head: u64,
        events: Mutex<Vec<ChainEvent>>,
        pub fail: bool,
    }

    impl FakeChainClient {
        pub fn new(head: u64, events: Vec<ChainEvent>) -> Self {
            Self {
                head,
                events: Mutex::new(events),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn push(&self, event: ChainEvent) {
            self.events.lock().push(event);
        }

        fn check(&self) -> AppResult<()> {
            if self.fail {
                return Err(ChainError::Rpc {
                    network: "fake".into(),
                    message: "connection refused".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChainClient for FakeChainClient {
        async fn current_block_height(&self) -> AppResult<u64> {
            self.check()?;
            Ok(self.head)
        }

        async fn filter_logs(&self, query: &LogQuery) -> AppResult<Vec<ChainEvent>> {
            self.check()?;
            let matching = self
                .events
                .lock()
                .iter()
                .filter(|e| e.matches(&query.filter))
                .cloned()
                .collect();
            Ok(in_block_order(matching, query))
        }

        async fn transaction_events(&self, tx_hash: &str) -> AppResult<Vec<ChainEvent>> {
            self.check()?;
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| e.tx_hash() == tx_hash)
                .cloned()
                .collect())
        }
    }

    /// Lifecycle service that records each call as `(action, subject)`
    #[derive(Default)]
    pub struct RecordingLifecycle {
        calls: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingLifecycle {
        pub fn calls(&self) -> Vec<(&'static str, String)> {
            self.calls.lock().clone()
        }

        pub fn count(&self, action: &str) -> usize {
            self.calls.lock().iter().filter(|(a, _)| *a == action).count()
        }

        fn record(&self, action: &'static str, subject: String) -> AppResult<Option<String>> {
            self.calls.lock().push((action, subject));
            Ok(Some(format!("0x{}", action)))
        }
    }

    #[async_trait]
    impl OrderLifecycle for RecordingLifecycle {
        async fn create_order(&self, order: &PaymentOrder) -> AppResult<Option<String>> {
            self.record("create", order.id.to_string())
        }

        async fn settle_order(&self, order: &LockPaymentOrder) -> AppResult<Option<String>> {
            self.record("settle", order.id.to_string())
        }

        async fn refund_order(&self, _network: &Network, gateway_id: &str) -> AppResult<Option<String>> {
            self.record("refund", gateway_id.to_string())
        }

        async fn revert_order(&self, order: &PaymentOrder) -> AppResult<Option<String>> {
            self.record("revert", order.id.to_string())
        }
    }

    /// Oracle with a fixed answer; `None` simulates an outage
    pub struct FakeCompliance(pub Option<ComplianceDecision>);

    #[async_trait]
    impl ComplianceOracle for FakeCompliance {
        async fn check_compliance(&self, _rpc_endpoint: &str, _tx_hash: &str) -> AppResult<ComplianceDecision> {
            self.0
                .ok_or_else(|| AppError::ExternalError("oracle unavailable".into()))
        }
    }

    /// Ciphertext is the plaintext
    pub struct PlainDecryptor;

    #[async_trait]
    impl MessageDecryptor for PlainDecryptor {
        async fn decrypt(&self, ciphertext: &[u8]) -> AppResult<Vec<u8>> {
            Ok(ciphertext.to_vec())
        }
    }

    #[derive(Default)]
    pub struct FakePriceFeed {
        rates: HashMap<String, Decimal>,
    }

    impl FakePriceFeed {
        pub fn with_rate(mut self, currency: &str, rate: Decimal) -> Self {
            self.rates.insert(currency.to_string(), rate);
            self
        }
    }

    #[async_trait]
    impl PriceFeed for FakePriceFeed {
        async fn usdt_rate(&self, currency_code: &str) -> AppResult<Decimal> {
            self.rates
                .get(currency_code)
                .copied()
                .ok_or_else(|| AppError::ExternalError(format!("no ticker for {}", currency_code)))
        }
    }
}
