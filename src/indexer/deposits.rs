use std::cmp::Ordering;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use super::Indexer;
use crate::chain::abi;
use crate::chain::{ChainEvent, LogFilter, LogQuery, NetworkHandle, TransferEvent};
use crate::error::{AppResult, AssignmentError, ChainError, OrderError};
use crate::ledger::models::{PaymentOrder, ReceiveAddress, ReceiveAddressStatus, Token};
use crate::ledger::store::DepositRecord;

impl Indexer {
    // ========== DEPOSITS ==========

    /// Index transfers for every order on the network still collecting funds
    pub async fn index_deposits(&self, handle: &NetworkHandle) -> AppResult<usize> {
        let orders = self.store.orders_awaiting_deposit(handle.identifier()).await?;
        let mut completed = 0;
        for order in &orders {
            match self.index_deposit_transfer(handle, order).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => error!("❌ Deposit indexing failed for order {}: {}", order.id, e),
            }
        }
        debug!(
            "Indexed deposits for {} orders on {}, {} completed",
            orders.len(),
            handle.identifier(),
            completed
        );
        Ok(completed)
    }

    /// Apply transfers into the order's receive address. Returns true once
    /// the address has been fully paid.
    #[instrument(skip_all, fields(order_id = %order.id, network = %handle.identifier()))]
    pub async fn index_deposit_transfer(&self, handle: &NetworkHandle, order: &PaymentOrder) -> AppResult<bool> {
        let address_id = order.receive_address_id.ok_or_else(|| {
            OrderError::MissingReference(format!("receive address for order {}", order.id))
        })?;
        let mut address = self
            .store
            .receive_address(address_id)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("receive address {}", address_id)))?;
        let token = self
            .store
            .token(order.token_id)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("token {}", order.token_id)))?;

        let head = handle.client.current_block_height().await?;
        let query = LogQuery::recent(
            LogFilter::Transfers {
                token: token.contract_address.clone(),
                to: address.address.clone(),
            },
            head,
            self.config.deposit_lookback_blocks,
        );

        let mut order = order.clone();
        for event in handle.client.filter_logs(&query).await? {
            let ChainEvent::Transfer(transfer) = event else {
                continue;
            };
            match self
                .apply_transfer(handle, &mut order, &mut address, &token, &transfer)
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => error!("❌ Failed to apply transfer {}: {}", transfer.tx_hash, e),
            }
        }
        Ok(false)
    }

    async fn apply_transfer(
        &self,
        handle: &NetworkHandle,
        order: &mut PaymentOrder,
        address: &mut ReceiveAddress,
        token: &Token,
        transfer: &TransferEvent,
    ) -> AppResult<bool> {
        if !transfer.to.eq_ignore_ascii_case(&address.address) {
            return Ok(false);
        }
        let already_seen = (address.tx_hash.as_deref() == Some(transfer.tx_hash.as_str())
            && address.status != ReceiveAddressStatus::Unused)
            || order.tx_hash.as_deref() == Some(transfer.tx_hash.as_str());
        if already_seen {
            debug!("Transfer {} already indexed", transfer.tx_hash);
            return Ok(false);
        }

        let value = abi::scale_units(transfer.value, token.scale()).map_err(|message| ChainError::Decode {
            network: handle.identifier().to_string(),
            what: "transfer value",
            message,
        })?;
        let expected = order.expected_amount(token.scale());
        let mut comparison = value.cmp(&expected);

        // P2P orders settle whatever arrived instead of reverting
        let mut amount_override = None;
        let mut rate_override = None;
        if order.recipient.is_p2p() && comparison != Ordering::Equal {
            amount_override = Some(value.round_dp(2));
            let stale_after = Duration::minutes(self.config.p2p_rate_refresh_after_mins);
            if order.created_at < Utc::now() - stale_after {
                rate_override = Some(self.current_provider_rate(order, token).await?);
            }
            comparison = Ordering::Equal;
        }

        let paid = order.amount_paid + value;
        let address_status = match comparison {
            Ordering::Equal | Ordering::Greater => ReceiveAddressStatus::Used,
            Ordering::Less if paid >= expected => ReceiveAddressStatus::Used,
            Ordering::Less => ReceiveAddressStatus::Partial,
        };

        let recorded = self
            .store
            .record_deposit(DepositRecord {
                order_id: order.id,
                receive_address_id: address.id,
                network: handle.identifier().to_string(),
                tx_hash: transfer.tx_hash.clone(),
                from_address: transfer.from.clone(),
                value,
                block_number: transfer.block_number as i64,
                address_status,
                amount_override,
                rate_override,
            })
            .await?;
        let Some(updated) = recorded else {
            return Ok(false);
        };

        *order = updated;
        address.status = address_status;
        address.tx_hash = Some(transfer.tx_hash.clone());
        address.last_indexed_block = Some(transfer.block_number as i64);
        info!(
            "💰 Deposit of {} {} into {} ({:?}, paid {} of {})",
            value, token.symbol, address.address, address_status, order.amount_paid, expected
        );

        if comparison == Ordering::Equal {
            self.create_on_chain(handle, order).await?;
            return Ok(true);
        }

        // excess on a used address waits for the validity sweep
        if address_status == ReceiveAddressStatus::Partial {
            self.handle_receive_address_validity(handle, order, address).await?;
        }
        Ok(address_status == ReceiveAddressStatus::Used)
    }

    /// Submit the on-chain order and pick up its events straight away
    pub(crate) async fn create_on_chain(&self, handle: &NetworkHandle, order: &PaymentOrder) -> AppResult<()> {
        let tx_hash = handle.lifecycle.create_order(order).await?;
        info!("🚀 On-chain order requested for payment order {}", order.id);

        if let Some(tx_hash) = tx_hash {
            if let Err(e) = self.index_transaction(handle, &tx_hash).await {
                debug!("Order {} creation not indexable yet: {}", order.id, e);
            }
        }
        Ok(())
    }

    /// Rate the order's target provider currently quotes for the token
    async fn current_provider_rate(&self, order: &PaymentOrder, token: &Token) -> AppResult<Decimal> {
        let provider_id = order.recipient.provider_id.as_deref().unwrap_or_default();
        let provider = self
            .store
            .provider(provider_id)
            .await?
            .ok_or_else(|| AssignmentError::ProviderNotFound(provider_id.to_string()))?;
        let currency = self
            .store
            .fiat_currency(&provider.currency_code)
            .await?
            .ok_or_else(|| OrderError::MissingReference(format!("fiat currency {}", provider.currency_code)))?;
        self.queue.get_provider_rate(&provider, &token.symbol, &currency)
    }

    // ========== RECEIVE ADDRESS VALIDITY ==========

    /// Expire, extend or revert an order whose receive address deadline matters
    pub async fn handle_receive_address_validity(
        &self,
        handle: &NetworkHandle,
        order: &PaymentOrder,
        address: &ReceiveAddress,
    ) -> AppResult<()> {
        let Some(valid_until) = address.valid_until else {
            return Ok(());
        };
        let now = Utc::now();

        match address.status {
            ReceiveAddressStatus::Unused | ReceiveAddressStatus::Partial => {
                if valid_until >= now {
                    return Ok(());
                }
                let far_gone = valid_until < now - Duration::minutes(self.config.address_grace_mins);
                if far_gone && order.amount_paid.is_zero() {
                    let extended = now + Duration::seconds(self.config.receive_address_validity_secs);
                    self.store.extend_receive_address(address.id, extended).await?;
                    info!("⏳ Receive address {} extended to {}", address.address, extended);
                    return Ok(());
                }

                if self.store.expire_order(order.id).await? {
                    warn!("⌛ Order {} expired with {} paid", order.id, order.amount_paid);
                    if order.amount_paid > Decimal::ZERO {
                        handle.lifecycle.revert_order(order).await?;
                    }
                }
            }
            ReceiveAddressStatus::Used => {
                let token = self.store.token(order.token_id).await?;
                let decimals = token.as_ref().map(Token::scale).unwrap_or(18);
                let excess = order.amount_paid - order.expected_amount(decimals);
                if excess > Decimal::ZERO && order.amount_returned.is_zero() {
                    info!("↩️  Reverting excess {} on order {}", excess, order.id);
                    handle.lifecycle.revert_order(order).await?;
                }
            }
            ReceiveAddressStatus::Expired => {}
        }
        Ok(())
    }

    /// Validity pass over every order whose address lapsed or was overpaid
    pub async fn sweep_receive_address_validity(&self) -> AppResult<usize> {
        let orders = self.store.orders_with_lapsed_addresses(Utc::now()).await?;
        let mut handled = 0;
        for order in &orders {
            let result = async {
                let (handle, _) = self.handle_for_order(order).await?;
                let address_id = order.receive_address_id.ok_or_else(|| {
                    OrderError::MissingReference(format!("receive address for order {}", order.id))
                })?;
                let address = self
                    .store
                    .receive_address(address_id)
                    .await?
                    .ok_or_else(|| OrderError::MissingReference(format!("receive address {}", address_id)))?;
                self.handle_receive_address_validity(&handle, order, &address).await
            }
            .await;

            match result {
                Ok(()) => handled += 1,
                Err(e) => error!("❌ Validity check failed for order {}: {}", order.id, e),
            }
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::harness;
    use crate::chain::{ChainEvent, TransferEvent};
    use crate::ledger::models::*;
    use crate::ledger::OrderStore;
    use crate::testing::fakes::FakeChainClient;
    use crate::testing::fixtures;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn transfer(to: &str, tx: &str, value: u128, block: u64) -> ChainEvent {
        ChainEvent::Transfer(TransferEvent {
            block_number: block,
            tx_hash: tx.into(),
            token: fixtures::TOKEN_ADDRESS.into(),
            from: "0xsender".into(),
            to: to.into(),
            value,
        })
    }

    #[tokio::test]
    async fn test_exact_deposit_marks_used_and_creates_once() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (mut order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;
        order.sender_fee = dec!(0.5);
        order.network_fee = dec!(0.25);
        h.store.insert_payment_order(order.clone()).await;

        // 100.75 with 6 decimals
        h.chain.push(transfer(&address.address, "0xdeposit", 100_750_000, 990));

        assert!(h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());
        assert!(!h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());

        let address = h.store.receive_address(address.id).await.unwrap().unwrap();
        assert_eq!(address.status, ReceiveAddressStatus::Used);
        let stored = h.store.payment_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_paid, dec!(100.75));
        assert_eq!(h.lifecycle.count("create"), 1);
    }

    #[tokio::test]
    async fn test_partial_deposits_accumulate() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;

        h.chain.push(transfer(&address.address, "0xfirst", 40_000_000, 900));
        assert!(!h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());
        assert_eq!(
            h.store.receive_address(address.id).await.unwrap().unwrap().status,
            ReceiveAddressStatus::Partial
        );

        let order = h.store.payment_order(order.id).await.unwrap().unwrap();
        h.chain.push(transfer(&address.address, "0xsecond", 60_000_000, 950));
        assert!(h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());

        let stored = h.store.payment_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_paid, dec!(100));
        assert_eq!(
            h.store.receive_address(address.id).await.unwrap().unwrap().status,
            ReceiveAddressStatus::Used
        );
        // creation is left to the reconciliation pass
        assert_eq!(h.lifecycle.count("create"), 0);
    }

    #[tokio::test]
    async fn test_overpayment_revert_waits_for_validity_sweep() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;

        h.chain.push(transfer(&address.address, "0xover", 120_000_000, 990));
        assert!(h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());

        assert_eq!(
            h.store.receive_address(address.id).await.unwrap().unwrap().status,
            ReceiveAddressStatus::Used
        );
        assert_eq!(h.lifecycle.count("create"), 0);
        assert_eq!(h.lifecycle.count("revert"), 0);

        assert_eq!(h.indexer.sweep_receive_address_validity().await.unwrap(), 1);
        assert_eq!(h.lifecycle.count("revert"), 1);
    }

    #[tokio::test]
    async fn test_partial_deposits_overshooting_total_defer_revert() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;

        h.chain.push(transfer(&address.address, "0xfirst", 70_000_000, 900));
        h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap();
        let order = h.store.payment_order(order.id).await.unwrap().unwrap();
        h.chain.push(transfer(&address.address, "0xsecond", 50_000_000, 950));
        assert!(h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());

        assert_eq!(
            h.store.payment_order(order.id).await.unwrap().unwrap().amount_paid,
            dec!(120)
        );
        assert_eq!(h.lifecycle.count("revert"), 0);
        assert_eq!(h.indexer.sweep_receive_address_validity().await.unwrap(), 1);
        assert_eq!(h.lifecycle.count("revert"), 1);
    }

    #[tokio::test]
    async fn test_transfers_outside_lookback_are_ignored() {
        let h = harness(FakeChainClient::new(10_000, vec![]), None, false);
        let (order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;

        h.chain.push(transfer(&address.address, "0xold", 100_000_000, 1_000));
        assert!(!h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());
        assert_eq!(h.store.payment_order(order.id).await.unwrap().unwrap().amount_paid, dec!(0));
    }

    #[tokio::test]
    async fn test_p2p_order_takes_received_amount() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (mut order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;
        order.recipient.provider_id = Some("prov-1".into());
        order.recipient.memo = Some("P#P desk trade".into());
        h.store.insert_payment_order(order.clone()).await;

        h.chain.push(transfer(&address.address, "0xp2p", 87_123_456, 990));
        assert!(h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap());

        let stored = h.store.payment_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.amount, dec!(87.12));
        assert_eq!(stored.rate, dec!(1500));
        assert_eq!(h.lifecycle.count("create"), 1);
        assert_eq!(h.lifecycle.count("revert"), 0);
    }

    #[tokio::test]
    async fn test_stale_p2p_order_refreshes_rate() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        fixtures::seed_ngn_market(&h.store, &[]).await;
        fixtures::seed_provider(&h.store, "prov-1", &[], dec!(1)).await;
        let (mut order, address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;
        order.recipient.provider_id = Some("prov-1".into());
        order.recipient.memo = Some("P#P".into());
        order.created_at = Utc::now() - Duration::hours(1);
        h.store.insert_payment_order(order.clone()).await;

        h.chain.push(transfer(&address.address, "0xp2p", 50_000_000, 990));
        h.indexer.index_deposit_transfer(&h.handle, &order).await.unwrap();

        let stored = h.store.payment_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.rate, dec!(1480));
    }

    #[tokio::test]
    async fn test_unpaid_lapsed_address_is_extended() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (order, mut address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;
        address.valid_until = Some(Utc::now() - Duration::minutes(30));
        h.store.insert_receive_address(address.clone()).await;

        h.indexer
            .handle_receive_address_validity(&h.handle, &order, &address)
            .await
            .unwrap();

        let stored = h.store.receive_address(address.id).await.unwrap().unwrap();
        assert!(stored.valid_until.unwrap() > Utc::now());
        assert_eq!(
            h.store.payment_order(order.id).await.unwrap().unwrap().status,
            PaymentOrderStatus::Initiated
        );
    }

    #[tokio::test]
    async fn test_partly_paid_lapsed_address_expires_and_reverts() {
        let h = harness(FakeChainClient::new(1_000, vec![]), None, false);
        let (mut order, mut address, _) = fixtures::seed_payment_order(&h.store, dec!(100)).await;
        order.amount_paid = dec!(30);
        h.store.insert_payment_order(order.clone()).await;
        address.status = ReceiveAddressStatus::Partial;
        address.valid_until = Some(Utc::now() - Duration::minutes(30));
        h.store.insert_receive_address(address.clone()).await;

        assert_eq!(h.indexer.sweep_receive_address_validity().await.unwrap(), 1);

        assert_eq!(
            h.store.payment_order(order.id).await.unwrap().unwrap().status,
            PaymentOrderStatus::Expired
        );
        assert_eq!(
            h.store.receive_address(address.id).await.unwrap().unwrap().status,
            ReceiveAddressStatus::Expired
        );
        assert_eq!(h.lifecycle.count("revert"), 1);
    }
}
