use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::ledger::models::{ConversionRateType, ProviderProfile};
use crate::ledger::OrderStore;
use crate::retry::RetryPolicy;

/// Stablecoins whose fixed provider rates feed the market median
const STABLECOINS: [&str; 2] = ["USDT", "USDC"];

/// External USDT/fiat reference price
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn usdt_rate(&self, currency_code: &str) -> AppResult<Decimal>;
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    data: TickerData,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    ticker: Ticker,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    buy: String,
}

/// Exchange ticker endpoint `/api/v1/markets/tickers/usdt{currency}`
pub struct QuidaxPriceFeed {
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl QuidaxPriceFeed {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            retry,
        }
    }

    async fn fetch(&self, url: &str) -> AppResult<Decimal> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "price feed returned HTTP {}",
                response.status()
            )));
        }
        let body: TickerResponse = response.json().await?;
        Ok(body.data.ticker.buy.trim().parse::<Decimal>()?)
    }
}

#[async_trait]
impl PriceFeed for QuidaxPriceFeed {
    async fn usdt_rate(&self, currency_code: &str) -> AppResult<Decimal> {
        let url = format!(
            "{}/api/v1/markets/tickers/usdt{}",
            self.base_url,
            currency_code.to_ascii_lowercase()
        );
        self.retry
            .run("price feed", || self.fetch(&url))
            .await
    }
}

pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

/// |external - candidate| as a percentage of external
pub fn percent_deviation(external: Decimal, candidate: Decimal) -> Decimal {
    if external.is_zero() {
        return Decimal::ONE_HUNDRED;
    }
    ((external - candidate).abs() / external) * Decimal::ONE_HUNDRED
}

/// Median of the fixed rates, unless it strays beyond `tolerance` percent
/// of the external rate or there is nothing to take a median of
pub fn select_market_rate(external: Decimal, fixed_rates: &[Decimal], tolerance: Decimal) -> Decimal {
    match median(fixed_rates) {
        Some(m) if percent_deviation(external, m) <= tolerance => m,
        _ => external,
    }
}

fn fixed_stablecoin_rates(providers: &[ProviderProfile]) -> Vec<Decimal> {
    providers
        .iter()
        .flat_map(|p| p.order_tokens.iter())
        .filter(|t| {
            t.conversion_rate_type == ConversionRateType::Fixed
                && STABLECOINS.iter().any(|s| t.symbol.eq_ignore_ascii_case(s))
        })
        .map(|t| t.fixed_conversion_rate)
        .collect()
}

/// Recompute the market rate of every enabled fiat currency
pub async fn compute_market_rates(
    store: &Arc<dyn OrderStore>,
    feed: &Arc<dyn PriceFeed>,
    tolerance: Decimal,
) -> AppResult<usize> {
    let currencies = store.enabled_fiat_currencies().await?;
    let mut updated = 0;

    for currency in &currencies {
        let external = match feed.usdt_rate(&currency.code).await {
            Ok(rate) => rate,
            Err(e) => {
                error!("❌ No external rate for {}: {}", currency.code, e);
                continue;
            }
        };

        let providers = store.currency_providers(&currency.code).await?;
        let fixed = fixed_stablecoin_rates(&providers);
        let rate = select_market_rate(external, &fixed, tolerance);
        if rate == external && !fixed.is_empty() {
            warn!(
                "⚠️  Provider median for {} strays from external {}, using external",
                currency.code, external
            );
        }

        store.set_fiat_market_rate(&currency.code, rate).await?;
        debug!("{} market rate {} ({} fixed quotes)", currency.code, rate, fixed.len());
        updated += 1;
    }

    info!("💱 Market rates refreshed for {}/{} currencies", updated, currencies.len());
    Ok(updated)
}
