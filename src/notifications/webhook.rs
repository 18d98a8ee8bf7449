use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrderConfig;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{PaymentOrder, PaymentOrderStatus, WebhookAttemptStatus, WebhookRetryAttempt};
use crate::ledger::OrderStore;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Hex HMAC-SHA256 of `body` keyed by the sender's webhook secret
pub fn sign_payload(body: &[u8], secret: &str) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `created + base * 2^(attempt - 1)`
pub fn next_retry_time(created_at: DateTime<Utc>, attempt_number: i32, base: Duration) -> DateTime<Utc> {
    let exponent = attempt_number.saturating_sub(1).clamp(0, 30) as u32;
    created_at + base * 2i32.pow(exponent)
}

fn event_name(status: PaymentOrderStatus) -> &'static str {
    match status {
        PaymentOrderStatus::Initiated => "payment_order.initiated",
        PaymentOrderStatus::Pending => "payment_order.pending",
        PaymentOrderStatus::Expired => "payment_order.expired",
        PaymentOrderStatus::Settled => "payment_order.settled",
        PaymentOrderStatus::Refunded => "payment_order.refunded",
    }
}

pub fn payment_order_payload(order: &PaymentOrder) -> Value {
    json!({
        "event": event_name(order.status),
        "data": {
            "id": order.id,
            "amount": order.amount.to_string(),
            "amount_paid": order.amount_paid.to_string(),
            "amount_returned": order.amount_returned.to_string(),
            "percent_settled": order.percent_settled.to_string(),
            "sender_fee": order.sender_fee.to_string(),
            "network_fee": order.network_fee.to_string(),
            "rate": order.rate.to_string(),
            "status": order.status,
            "gateway_id": order.gateway_id,
            "tx_hash": order.tx_hash,
            "from_address": order.from_address,
            "return_address": order.return_address,
            "recipient": order.recipient,
            "updated_at": order.updated_at,
        }
    })
}

/// Delivers signed order status notifications to senders
pub struct WebhookNotifier {
    store: Arc<dyn OrderStore>,
    http: reqwest::Client,
    base_delay: Duration,
    max_age: Duration,
}

impl WebhookNotifier {
    pub fn new(store: Arc<dyn OrderStore>, config: &OrderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            store,
            http,
            base_delay: Duration::seconds(config.webhook_base_delay_secs),
            max_age: Duration::hours(config.webhook_max_age_hours),
        }
    }

    async fn deliver(&self, url: &str, payload: &Value, signature: &str) -> AppResult<()> {
        let response = self
            .http
            .post(url)
            .header(SIGNATURE_HEADER, signature)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "webhook {} returned HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Notify the order's sender. A failed delivery is queued for retry
    /// rather than returned as an error.
    pub async fn send_payment_order_webhook(&self, order: &PaymentOrder) -> AppResult<()> {
        let Some(sender_id) = order.sender_profile_id else {
            return Ok(());
        };
        let Some(sender) = self.store.sender_profile(sender_id).await? else {
            warn!("⚠️  Sender profile {} not found for order {}", sender_id, order.id);
            return Ok(());
        };
        let Some(url) = sender.webhook_url.filter(|u| !u.is_empty()) else {
            return Ok(());
        };

        let payload = payment_order_payload(order);
        let signature = sign_payload(&serde_json::to_vec(&payload)?, &sender.webhook_secret)?;

        match self.deliver(&url, &payload, &signature).await {
            Ok(()) => {
                info!("📨 Webhook {} delivered for order {}", event_name(order.status), order.id);
            }
            Err(e) => {
                warn!("⚠️  Webhook for order {} failed, scheduling retry: {}", order.id, e);
                let now = Utc::now();
                let attempt = WebhookRetryAttempt {
                    id: Uuid::new_v4(),
                    attempt_number: 1,
                    next_retry_time: next_retry_time(now, 1, self.base_delay),
                    payload,
                    signature,
                    webhook_url: url,
                    status: WebhookAttemptStatus::Failed,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_webhook_attempt(&attempt).await?;
            }
        }
        Ok(())
    }

    /// Redeliver one failed attempt and persist its new state
    pub async fn retry_attempt(&self, mut attempt: WebhookRetryAttempt) -> AppResult<WebhookAttemptStatus> {
        let now = Utc::now();
        match self
            .deliver(&attempt.webhook_url, &attempt.payload, &attempt.signature)
            .await
        {
            Ok(()) => {
                attempt.status = WebhookAttemptStatus::Success;
            }
            Err(e) => {
                attempt.attempt_number += 1;
                attempt.next_retry_time =
                    next_retry_time(attempt.created_at, attempt.attempt_number, self.base_delay);
                if now - attempt.created_at > self.max_age
                    || attempt.next_retry_time - attempt.created_at > self.max_age
                {
                    warn!("⚠️  Webhook attempt {} expired after {} tries", attempt.id, attempt.attempt_number);
                    attempt.status = WebhookAttemptStatus::Expired;
                } else {
                    debug!(
                        "Webhook attempt {} failed ({}), next try at {}",
                        attempt.id, e, attempt.next_retry_time
                    );
                }
            }
        }
        attempt.updated_at = now;
        self.store.update_webhook_attempt(&attempt).await?;
        Ok(attempt.status)
    }

    /// Retry every failed attempt that is due
    pub async fn retry_failed_webhooks(&self) -> AppResult<usize> {
        let due = self.store.due_webhook_attempts(Utc::now()).await?;
        let mut delivered = 0;
        for attempt in due {
            let id = attempt.id;
            match self.retry_attempt(attempt).await {
                Ok(WebhookAttemptStatus::Success) => delivered += 1,
                Ok(_) => {}
                Err(e) => warn!("⚠️  Could not retry webhook attempt {}: {:?}", id, e),
            }
        }
        Ok(delivered)
    }
}
