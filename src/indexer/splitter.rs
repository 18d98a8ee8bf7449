//! Splitting orders that no single provision bucket can absorb.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Indexer;
use crate::chain::NetworkHandle;
use crate::compliance::ComplianceDecision;
use crate::error::{AppError, AppResult, OrderError};
use crate::ledger::models::{LockOrderStatus, ProvisionBucket};
use crate::ledger::store::{NewLockOrder, OrderCreatedLog};

/// A bucket and how many providers can serve it right now
#[derive(Debug, Clone)]
pub struct BucketCapacity {
    pub bucket: ProvisionBucket,
    pub providers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitAllocation {
    pub bucket_id: Uuid,
    pub fiat_amount: Decimal,
}

/// Partition `total` fiat into bucket-sized chunks.
///
/// Buckets are filled largest first, each at most once per available
/// provider. Whatever is left goes back on the work list until it fits
/// inside the largest bucket, at which point it lands in the bucket that
/// contains it (or the smallest bucket wide enough). If no bucket has
/// providers the largest one absorbs a chunk anyway.
pub fn plan_split(total: Decimal, capacities: &[BucketCapacity]) -> AppResult<Vec<SplitAllocation>> {
    if total <= Decimal::ZERO {
        return Err(AppError::InvalidInput(format!("cannot split {}", total)));
    }

    let mut buckets: Vec<&BucketCapacity> = capacities
        .iter()
        .filter(|c| c.bucket.max_amount > Decimal::ZERO)
        .collect();
    buckets.sort_by(|a, b| b.bucket.max_amount.cmp(&a.bucket.max_amount));
    let Some(largest) = buckets.first().map(|c| &c.bucket) else {
        return Err(OrderError::MissingReference("provision buckets to split into".into()).into());
    };

    let mut allocations = Vec::new();
    let mut work = vec![total];

    while let Some(remaining) = work.pop() {
        if remaining <= Decimal::ZERO {
            continue;
        }

        if remaining <= largest.max_amount {
            let target = buckets
                .iter()
                .rev()
                .find(|c| c.bucket.contains(remaining))
                .or_else(|| buckets.iter().rev().find(|c| c.bucket.max_amount >= remaining))
                .map(|c| c.bucket.id)
                .unwrap_or(largest.id);
            allocations.push(SplitAllocation {
                bucket_id: target,
                fiat_amount: remaining,
            });
            continue;
        }

        let mut left = remaining;
        for capacity in &buckets {
            let max = capacity.bucket.max_amount;
            let fits = (left / max).floor();
            let trips = fits.min(Decimal::from(capacity.providers as u64));
            let mut n = Decimal::ZERO;
            while n < trips {
                allocations.push(SplitAllocation {
                    bucket_id: capacity.bucket.id,
                    fiat_amount: max,
                });
                left -= max;
                n += Decimal::ONE;
            }
        }

        if left == remaining {
            allocations.push(SplitAllocation {
                bucket_id: largest.id,
                fiat_amount: largest.max_amount,
            });
            left -= largest.max_amount;
        }
        work.push(left);
    }

    Ok(allocations)
}

/// Lock orders for each allocation. Shares are derived from the fiat
/// chunk; the last order takes whatever keeps the totals exact.
pub fn split_orders(template: &NewLockOrder, allocations: &[SplitAllocation], fiat_total: Decimal) -> Vec<NewLockOrder> {
    let mut orders = Vec::with_capacity(allocations.len());
    let mut amount_left = template.amount;
    let mut percent_left = Decimal::ONE_HUNDRED;

    for (i, allocation) in allocations.iter().enumerate() {
        let (amount, percent) = if i + 1 == allocations.len() {
            (amount_left, percent_left)
        } else {
            let share = allocation.fiat_amount / fiat_total;
            let amount = if template.rate.is_zero() {
                template.amount * share
            } else {
                allocation.fiat_amount / template.rate
            };
            (amount.round_dp(8), (share * Decimal::ONE_HUNDRED).round_dp(4))
        };
        amount_left -= amount;
        percent_left -= percent;

        let mut order = template.clone();
        order.amount = amount;
        order.order_percent = percent;
        order.provision_bucket_id = Some(allocation.bucket_id);
        orders.push(order);
    }
    orders
}

impl Indexer {
    /// Spread an order that fits no bucket across several lock orders
    pub(crate) async fn split_lock_order(
        &self,
        handle: &NetworkHandle,
        template: NewLockOrder,
        fiat_total: Decimal,
        currency_code: &str,
        log: OrderCreatedLog,
    ) -> AppResult<()> {
        let mut capacities = Vec::new();
        for bucket in self.store.provision_buckets(currency_code).await? {
            let providers = self.store.bucket_providers(bucket.id).await?.len();
            capacities.push(BucketCapacity { bucket, providers });
        }
        let plan = plan_split(fiat_total, &capacities)?;

        if self.screen(handle, &template.tx_hash).await == ComplianceDecision::Deny {
            let gateway_id = template.gateway_id.clone();
            let mut refunded = template;
            refunded.status = LockOrderStatus::Refunded;
            if self.store.create_lock_order(refunded, log).await?.is_none() {
                debug!("Gateway order {} was indexed concurrently", gateway_id);
                return Ok(());
            }
            warn!("🚫 AML check denied split order {}, refunding", gateway_id);
            handle.lifecycle.refund_order(&handle.network, &gateway_id).await?;
            return Ok(());
        }

        let orders = split_orders(&template, &plan, fiat_total);
        let created = self.store.create_lock_orders(orders, log).await?;
        if created.is_empty() {
            debug!("Gateway order {} was indexed concurrently", template.gateway_id);
            return Ok(());
        }
        info!(
            "✂️  Gateway order {} split into {} lock orders ({} {})",
            template.gateway_id,
            created.len(),
            fiat_total,
            currency_code
        );

        for order in &created {
            if let Err(e) = self.queue.assign_lock_payment_order(order).await {
                warn!("⚠️  Split order {} left unassigned: {}", order.id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::priority_queue::order_request_key;
    use crate::assignment::AssignmentCache;
    use crate::chain::ChainEvent;
    use crate::indexer::orders::tests::{gateway_id, order_created};
    use crate::indexer::tests::harness;
    use crate::ledger::OrderStore;
    use crate::testing::fakes::FakeChainClient;
    use crate::testing::fixtures;
    use rust_decimal_macros::dec;

    fn capacity(min: Decimal, max: Decimal, providers: usize) -> BucketCapacity {
        BucketCapacity {
            bucket: ProvisionBucket {
                id: Uuid::new_v4(),
                min_amount: min,
                max_amount: max,
                currency_code: "NGN".into(),
            },
            providers,
        }
    }

    fn amounts(plan: &[SplitAllocation]) -> Vec<Decimal> {
        plan.iter().map(|a| a.fiat_amount).collect()
    }

    #[test]
    fn test_split_fills_largest_bucket_per_provider() {
        let buckets = [capacity(dec!(1000), dec!(100000), 2)];
        let plan = plan_split(dec!(250000), &buckets).unwrap();
        assert_eq!(amounts(&plan), vec![dec!(100000), dec!(100000), dec!(50000)]);
        assert!(plan.iter().all(|a| a.bucket_id == buckets[0].bucket.id));
    }

    #[test]
    fn test_split_conserves_total_across_buckets() {
        let small = capacity(dec!(1000), dec!(50000), 2);
        let large = capacity(dec!(50001), dec!(200000), 1);
        let buckets = [small.clone(), large.clone()];

        let plan = plan_split(dec!(530000), &buckets).unwrap();
        let total: Decimal = plan.iter().map(|a| a.fiat_amount).sum();
        assert_eq!(total, dec!(530000));
        assert_eq!(
            amounts(&plan),
            vec![dec!(200000), dec!(50000), dec!(50000), dec!(200000), dec!(30000)]
        );
        assert_eq!(plan[4].bucket_id, small.bucket.id);
        for allocation in &plan {
            let bucket = if allocation.bucket_id == small.bucket.id { &small } else { &large };
            assert!(allocation.fiat_amount <= bucket.bucket.max_amount);
        }
    }

    #[test]
    fn test_split_without_providers_still_terminates() {
        let buckets = [capacity(dec!(1000), dec!(100000), 0)];
        let plan = plan_split(dec!(250000), &buckets).unwrap();
        assert_eq!(amounts(&plan), vec![dec!(100000), dec!(100000), dec!(50000)]);
    }

    #[test]
    fn test_tail_below_every_minimum_goes_to_smallest_wide_bucket() {
        let small = capacity(dec!(1000), dec!(10000), 1);
        let large = capacity(dec!(10001), dec!(100000), 1);
        let plan = plan_split(dec!(100500), &[large.clone(), small.clone()]).unwrap();
        assert_eq!(amounts(&plan), vec![dec!(100000), dec!(500)]);
        assert_eq!(plan[1].bucket_id, small.bucket.id);
    }

    #[test]
    fn test_split_rejects_bad_input() {
        let buckets = [capacity(dec!(1000), dec!(100000), 1)];
        assert!(plan_split(Decimal::ZERO, &buckets).is_err());
        assert!(plan_split(dec!(5000), &[]).is_err());
        assert!(plan_split(dec!(5000), &[capacity(Decimal::ZERO, Decimal::ZERO, 3)]).is_err());
    }

    #[test]
    fn test_split_orders_keep_exact_totals() {
        let token = crate::ledger::models::Token {
            id: Uuid::new_v4(),
            symbol: "USDT".into(),
            contract_address: fixtures::TOKEN_ADDRESS.into(),
            decimals: 6,
            network: "base".into(),
            is_enabled: true,
        };
        let mut template = fixtures::new_lock_order(&token, "0xsplit", dec!(1));
        template.rate = dec!(300);
        let bucket = Uuid::new_v4();
        let plan: Vec<SplitAllocation> = (0..3)
            .map(|_| SplitAllocation {
                bucket_id: bucket,
                fiat_amount: dec!(100),
            })
            .collect();

        let orders = split_orders(&template, &plan, dec!(300));
        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].amount, dec!(0.33333333));
        assert_eq!(orders[0].order_percent, dec!(33.3333));
        assert_eq!(orders.iter().map(|o| o.amount).sum::<Decimal>(), dec!(1));
        assert_eq!(orders.iter().map(|o| o.order_percent).sum::<Decimal>(), dec!(100));
        assert!(orders.iter().all(|o| o.provision_bucket_id == Some(bucket)));
    }

    #[tokio::test]
    async fn test_denied_split_is_recorded_once_and_refunded() {
        let h = harness(FakeChainClient::new(1_000, vec![]), Some(ComplianceDecision::Deny), true);
        let buckets = fixtures::seed_ngn_market(&h.store, &[(dec!(1000), dec!(100000))]).await;
        fixtures::seed_token(&h.store).await;
        for i in 0..3 {
            fixtures::seed_provider(&h.store, &format!("prov-{}", i), &[buckets[0].id], dec!(1)).await;
        }
        h.chain
            .push(ChainEvent::OrderCreated(order_created(9, 250_000_000, 1000, None)));

        h.indexer.index_order_created(&h.handle, None).await.unwrap();

        let orders = h.store.lock_orders_by_gateway_id(&gateway_id(9)).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, LockOrderStatus::Refunded);
        assert_eq!(orders[0].amount, dec!(250));
        assert!(h.cache.get(&order_request_key(orders[0].id)).await.unwrap().is_none());
        assert_eq!(h.lifecycle.count("refund"), 1);
    }
}
