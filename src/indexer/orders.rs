use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::Indexer;
use crate::chain::abi::{self, RATE_DECIMALS, SETTLE_PERCENT_DECIMALS};
use crate::chain::{
    LogFilter, LogQuery, NetworkHandle, OrderCreatedEvent, OrderRefundedEvent, OrderSettledEvent,
};
use crate::compliance::ComplianceDecision;
use crate::error::{AppResult, AssignmentError, ChainError, OrderError};
use crate::ledger::models::{LockOrderStatus, VisibilityMode};
use crate::ledger::store::{NewLockOrder, OrderCreatedLog, RefundUpdate, SettlementUpdate};

fn decode_error<'a>(handle: &'a NetworkHandle, what: &'static str) -> impl Fn(String) -> ChainError + 'a {
    move |message| ChainError::Decode {
        network: handle.identifier().to_string(),
        what,
        message,
    }
}

impl Indexer {
    // ========== EVENT STREAMS ==========

    /// Index `OrderCreated` events in the recent window, optionally for one sender
    pub async fn index_order_created(&self, handle: &NetworkHandle, sender: Option<&str>) -> AppResult<usize> {
        let head = handle.client.current_block_height().await?;
        let query = LogQuery::recent(
            LogFilter::OrderCreated {
                sender: sender.map(str::to_string),
            },
            head,
            self.config.deposit_lookback_blocks,
        );
        let events = handle.client.filter_logs(&query).await?;
        Ok(self.process_batch(handle, events).await)
    }

    pub async fn index_order_settled(&self, handle: &NetworkHandle, gateway_id: Option<&str>) -> AppResult<usize> {
        let head = handle.client.current_block_height().await?;
        let query = LogQuery::recent(
            LogFilter::OrderSettled {
                order_id: gateway_id.map(str::to_string),
            },
            head,
            self.config.event_lookback_blocks,
        );
        let events = handle.client.filter_logs(&query).await?;
        Ok(self.process_batch(handle, events).await)
    }

    pub async fn index_order_refunded(&self, handle: &NetworkHandle, gateway_id: Option<&str>) -> AppResult<usize> {
        let head = handle.client.current_block_height().await?;
        let query = LogQuery::recent(
            LogFilter::OrderRefunded {
                order_id: gateway_id.map(str::to_string),
            },
            head,
            self.config.event_lookback_blocks,
        );
        let events = handle.client.filter_logs(&query).await?;
        Ok(self.process_batch(handle, events).await)
    }

    // ========== ORDER CREATED ==========

    /// Create the lock order(s) for a gateway order and hand them to assignment
    #[instrument(skip_all, fields(tx_hash = %event.tx_hash, network = %handle.identifier()))]
    pub async fn create_lock_payment_order(&self, handle: &NetworkHandle, event: &OrderCreatedEvent) -> AppResult<()> {
        let gateway_id = abi::normalize_hex(&event.order_id);
        if self.store.lock_order_exists(&event.tx_hash, &gateway_id).await? {
            debug!("Gateway order {} already indexed", gateway_id);
            return Ok(());
        }

        let token = self
            .store
            .token_by_address(handle.identifier(), &event.token)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("token {} on {}", event.token, handle.identifier())))?;
        let recipient = self.recipients.decode(&event.message_hash).await?;

        let institution = self
            .store
            .institution(&recipient.institution)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("institution {}", recipient.institution)))?;
        let currency = self
            .store
            .fiat_currency(&institution.currency_code)
            .await?
            .filter(|c| c.is_enabled)
            .ok_or_else(|| OrderError::MissingReference(format!("enabled fiat currency {}", institution.currency_code)))?;

        let amount = abi::scale_units(event.amount, token.scale()).map_err(decode_error(handle, "order amount"))?;
        let rate = abi::scale_units(event.rate, RATE_DECIMALS).map_err(decode_error(handle, "order rate"))?;
        let fiat_amount = (amount * rate).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);

        let bucket = self
            .store
            .provision_buckets(&currency.code)
            .await?
            .into_iter()
            .find(|b| b.contains(fiat_amount));

        let mut is_private = false;
        let mut max_order_amount = Decimal::ZERO;
        if let Some(provider_id) = &recipient.provider_id {
            let provider = self
                .store
                .provider(provider_id)
                .await?
                .ok_or_else(|| AssignmentError::ProviderNotFound(provider_id.clone()))?;
            is_private = provider.visibility == VisibilityMode::Private;
            max_order_amount = provider
                .order_token(&token.symbol)
                .map(|t| t.max_order_amount)
                .unwrap_or_default();
        }

        let log = OrderCreatedLog {
            network: handle.identifier().to_string(),
            tx_hash: event.tx_hash.clone(),
            gateway_id: gateway_id.clone(),
            block_number: event.block_number as i64,
            metadata: json!({
                "token": token.symbol,
                "amount": amount.to_string(),
                "rate": rate.to_string(),
                "memo": recipient.memo,
                "provider_id": recipient.provider_id,
                "provision_bucket": bucket.as_ref().map(|b| b.id),
            }),
        };
        let new_order = NewLockOrder {
            gateway_id: gateway_id.clone(),
            amount,
            rate,
            order_percent: Decimal::ONE_HUNDRED,
            tx_hash: event.tx_hash.clone(),
            block_number: event.block_number as i64,
            token_id: token.id,
            network: handle.identifier().to_string(),
            recipient,
            provision_bucket_id: bucket.as_ref().map(|b| b.id),
            status: LockOrderStatus::Pending,
        };

        if bucket.is_none() && !is_private {
            return self
                .split_lock_order(handle, new_order, fiat_amount, &currency.code, log)
                .await;
        }

        let refund_reason = if self.screen(handle, &event.tx_hash).await == ComplianceDecision::Deny {
            Some("AML check denied".to_string())
        } else if is_private && amount > max_order_amount {
            Some(format!("private order exceeds provider max {}", max_order_amount))
        } else {
            None
        };

        let mut new_order = new_order;
        if refund_reason.is_some() {
            new_order.status = LockOrderStatus::Refunded;
        }
        let Some(order) = self.store.create_lock_order(new_order, log).await? else {
            debug!("Gateway order {} was indexed concurrently", gateway_id);
            return Ok(());
        };

        if let Some(reason) = refund_reason {
            warn!("🚫 {} for {}, refunding {}", reason, event.tx_hash, gateway_id);
            handle.lifecycle.refund_order(&handle.network, &gateway_id).await?;
            return Ok(());
        }
        info!(
            "🔒 Lock order {} created for {} {} at {} (gateway {})",
            order.id, order.amount, token.symbol, order.rate, gateway_id
        );

        if let Err(e) = self.queue.assign_lock_payment_order(&order).await {
            warn!("⚠️  Lock order {} left unassigned: {}", order.id, e);
        }
        Ok(())
    }

    // ========== SETTLEMENT & REFUND ==========

    #[instrument(skip_all, fields(tx_hash = %event.tx_hash, network = %handle.identifier()))]
    pub async fn update_order_status_settled(&self, handle: &NetworkHandle, event: &OrderSettledEvent) -> AppResult<()> {
        let gateway_id = abi::normalize_hex(&event.order_id);
        let split_order_id = abi::split_order_uuid(&event.split_order_id).ok_or_else(|| ChainError::Decode {
            network: handle.identifier().to_string(),
            what: "split order id",
            message: event.split_order_id.clone(),
        })?;
        let settle_percent = abi::scale_units(event.settle_percent, SETTLE_PERCENT_DECIMALS)
            .map_err(decode_error(handle, "settle percent"))?;

        let outcome = self
            .store
            .apply_order_settled(SettlementUpdate {
                gateway_id: gateway_id.clone(),
                split_order_id,
                network: handle.identifier().to_string(),
                tx_hash: event.tx_hash.clone(),
                block_number: event.block_number as i64,
                liquidity_provider: event.liquidity_provider.clone(),
                settle_percent,
            })
            .await?;
        if !outcome.applied {
            debug!("Split order {} already settled", split_order_id);
            return Ok(());
        }

        info!("✅ Split order {} settled ({}% of {})", split_order_id, settle_percent, gateway_id);
        if let Some(order) = outcome.payment_order {
            self.webhooks.send_payment_order_webhook(&order).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(tx_hash = %event.tx_hash, network = %handle.identifier()))]
    pub async fn update_order_status_refunded(&self, handle: &NetworkHandle, event: &OrderRefundedEvent) -> AppResult<()> {
        let gateway_id = abi::normalize_hex(&event.order_id);
        let Some(lock_order) = self
            .store
            .lock_orders_by_gateway_id(&gateway_id)
            .await?
            .into_iter()
            .next()
        else {
            debug!("Refund for unknown gateway order {}", gateway_id);
            return Ok(());
        };

        let decimals = self
            .store
            .token(lock_order.token_id)
            .await?
            .map(|t| t.scale())
            .unwrap_or(18);
        let fee = abi::scale_units(event.fee, decimals).map_err(decode_error(handle, "refund fee"))?;

        let refunded = self
            .store
            .apply_order_refunded(RefundUpdate {
                gateway_id: gateway_id.clone(),
                network: handle.identifier().to_string(),
                tx_hash: event.tx_hash.clone(),
                block_number: event.block_number as i64,
                fee,
            })
            .await?;

        if let Some(order) = refunded {
            info!("↩️  Payment order {} refunded (gateway {})", order.id, gateway_id);
            self.webhooks.send_payment_order_webhook(&order).await?;
        }
        Ok(())
    }
}
