use std::time::Duration;

use serde::Deserialize;

/// Service configuration, layered from defaults and environment variables.
///
/// Nested sections use a double underscore, e.g. `ORDER__ORDER_REQUEST_VALIDITY_SECS=90`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind_address: String,
    /// `production` enables the AML gate
    pub environment: String,
    pub key_service_url: String,
    pub relayer_url: String,
    pub relayer_api_key: Option<String>,
    pub price_feed_url: String,
    pub compliance_url: String,
    pub compliance_api_key: Option<String>,
    pub tron_api_key: Option<String>,
    #[serde(default)]
    pub order: OrderConfig,
    #[serde(default)]
    pub jobs: JobIntervals,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("environment", "development")?
            .set_default("key_service_url", "http://localhost:8300")?
            .set_default("relayer_url", "http://localhost:8400")?
            .set_default("price_feed_url", "https://www.quidax.com")?
            .set_default("compliance_url", "https://rpc.shield3.com/v3")?
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

/// Timing and window parameters for order processing
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrderConfig {
    pub order_request_validity_secs: u64,
    pub receive_address_validity_secs: i64,
    pub address_grace_mins: i64,
    pub deposit_lookback_blocks: u64,
    pub event_lookback_blocks: u64,
    pub percent_deviation_from_market_rate: rust_decimal::Decimal,
    pub p2p_rate_refresh_after_mins: i64,
    pub bucket_availability_horizon_mins: i64,
    pub webhook_base_delay_secs: i64,
    pub webhook_max_age_hours: i64,
    pub rpc_retry_attempts: u32,
    pub rpc_retry_delay_ms: u64,
    pub create_window_mins: i64,
    pub revert_idle_mins: i64,
    pub settle_idle_mins: i64,
    pub refund_age_mins: i64,
    pub refund_index_age_mins: i64,
    pub cache_sweep_interval_ms: u64,
    pub exclude_list_ttl_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            order_request_validity_secs: 120,
            receive_address_validity_secs: 1800,
            address_grace_mins: 5,
            deposit_lookback_blocks: 5_000,
            event_lookback_blocks: 50_000,
            percent_deviation_from_market_rate: rust_decimal_macros::dec!(10),
            p2p_rate_refresh_after_mins: 30,
            bucket_availability_horizon_mins: 60,
            webhook_base_delay_secs: 120,
            webhook_max_age_hours: 24,
            rpc_retry_attempts: 3,
            rpc_retry_delay_ms: 1_000,
            create_window_mins: 10,
            revert_idle_mins: 10,
            settle_idle_mins: 5,
            refund_age_mins: 30,
            refund_index_age_mins: 35,
            cache_sweep_interval_ms: 1_000,
            exclude_list_ttl_secs: 86_400,
        }
    }
}

impl OrderConfig {
    pub fn order_request_validity(&self) -> Duration {
        Duration::from_secs(self.order_request_validity_secs)
    }

    /// How long providers stay excluded from an order after letting it lapse
    pub fn exclude_list_ttl(&self) -> Duration {
        Duration::from_secs(self.exclude_list_ttl_secs)
    }

    pub fn rpc_retry(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            attempts: self.rpc_retry_attempts,
            delay: Duration::from_millis(self.rpc_retry_delay_ms),
        }
    }
}

/// Period of each reconciliation job, in seconds
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobIntervals {
    pub index_blockchain_events_secs: u64,
    pub retry_stale_user_operations_secs: u64,
    pub receive_address_validity_secs: u64,
    pub compute_market_rate_secs: u64,
    pub process_bucket_queues_secs: u64,
    pub retry_failed_webhooks_secs: u64,
    pub reassign_pending_orders_secs: u64,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            index_blockchain_events_secs: 60,
            retry_stale_user_operations_secs: 120,
            receive_address_validity_secs: 31 * 60,
            compute_market_rate_secs: 4 * 60,
            process_bucket_queues_secs: 10 * 60,
            retry_failed_webhooks_secs: 60 * 60,
            reassign_pending_orders_secs: 13 * 60,
        }
    }
}
