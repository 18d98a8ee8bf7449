use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{prelude::FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult};

const PAYMENT_ORDER_COLUMNS: &str = r#"
    po.id, po.amount, po.amount_paid, po.amount_returned, po.percent_settled,
    po.protocol_fee, po.sender_fee, po.network_fee, po.rate, po.status, po.gateway_id,
    po.tx_hash, po.block_number, po.from_address, po.return_address, po.receive_address_id,
    po.token_id, po.sender_profile_id, po.institution, po.account_identifier,
    po.account_name, po.memo, po.provider_id, po.created_at, po.updated_at
"#;

const LOCK_ORDER_COLUMNS: &str = r#"
    lo.id, lo.gateway_id, lo.amount, lo.rate, lo.order_percent, lo.tx_hash, lo.status,
    lo.block_number, lo.token_id, lo.network, lo.institution, lo.account_identifier,
    lo.account_name, lo.memo, lo.provider_id, lo.provision_bucket_id,
    lo.cancellation_count, lo.created_at, lo.updated_at
"#;

const FULLY_PAID: &str =
    "po.amount_paid >= ROUND(po.amount + po.protocol_fee + po.sender_fee + po.network_fee, t.decimals)";

#[derive(FromRow)]
struct ProviderRow {
    id: String,
    trading_name: String,
    currency_code: String,
    visibility: VisibilityMode,
    is_active: bool,
    cadence: AvailabilityCadence,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    trust_score: Decimal,
}

#[derive(FromRow)]
struct ProviderTokenRow {
    provider_id: String,
    #[sqlx(flatten)]
    token: ProviderOrderToken,
}

/// Postgres order store - THE source of truth for order state
pub struct PgOrderStore {
    pub pool: PgPool,
}

fn is_unique_violation(error: &AppError) -> bool {
    match error {
        AppError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
        _ => false,
    }
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn payment_orders_where(&self, predicate: &str, bind: DateTime<Utc>) -> AppResult<Vec<PaymentOrder>> {
        let sql = format!(
            r#"
            SELECT {PAYMENT_ORDER_COLUMNS}
            FROM payment_orders po
            JOIN tokens t ON t.id = po.token_id
            LEFT JOIN receive_addresses ra ON ra.id = po.receive_address_id
            WHERE {predicate}
            "#
        );
        Ok(sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn lock_orders_where(
        &self,
        predicate: &str,
        network: Option<&str>,
        bind: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let sql = format!(
            r#"
            SELECT {LOCK_ORDER_COLUMNS}
            FROM lock_payment_orders lo
            LEFT JOIN payment_orders po ON po.gateway_id = lo.gateway_id
            WHERE {predicate}
            "#
        );
        let mut query = sqlx::query_as::<_, LockPaymentOrder>(&sql);
        if let Some(network) = network {
            query = query.bind(network.to_string());
        }
        if let Some(bind) = bind {
            query = query.bind(bind);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn hydrate_providers(&self, rows: Vec<ProviderRow>) -> AppResult<Vec<ProviderProfile>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

        let memberships: Vec<(String, Uuid)> = sqlx::query_as(
            "SELECT provider_id, bucket_id FROM provider_buckets WHERE provider_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let tokens = sqlx::query_as::<_, ProviderTokenRow>(
            r#"
            SELECT provider_id, symbol, conversion_rate_type, fixed_conversion_rate,
                   floating_conversion_rate, max_order_amount, min_order_amount
            FROM provider_order_tokens
            WHERE provider_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut buckets_by_provider: HashMap<String, Vec<Uuid>> = HashMap::new();
        for (provider_id, bucket_id) in memberships {
            buckets_by_provider.entry(provider_id).or_default().push(bucket_id);
        }
        let mut tokens_by_provider: HashMap<String, Vec<ProviderOrderToken>> = HashMap::new();
        for row in tokens {
            tokens_by_provider.entry(row.provider_id).or_default().push(row.token);
        }

        Ok(rows
            .into_iter()
            .map(|row| ProviderProfile {
                bucket_ids: buckets_by_provider.remove(&row.id).unwrap_or_default(),
                order_tokens: tokens_by_provider.remove(&row.id).unwrap_or_default(),
                id: row.id,
                trading_name: row.trading_name,
                currency_code: row.currency_code,
                visibility: row.visibility,
                is_active: row.is_active,
                availability: ProviderAvailability {
                    cadence: row.cadence,
                    start_time: row.start_time,
                    end_time: row.end_time,
                },
                trust_score: row.trust_score,
            })
            .collect())
    }

    async fn insert_log(
        tx: &mut Transaction<'_, Postgres>,
        status: TransactionStatus,
        network: &str,
        tx_hash: &str,
        gateway_id: Option<&str>,
        metadata: serde_json::Value,
        payment_order_id: Option<Uuid>,
        lock_order_id: Option<Uuid>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_logs
                (id, gateway_id, status, network, tx_hash, metadata, payment_order_id, lock_order_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(gateway_id)
        .bind(status)
        .bind(network)
        .bind(tx_hash)
        .bind(metadata)
        .bind(payment_order_id)
        .bind(lock_order_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

const PROVIDER_COLUMNS: &str = r#"
    id, trading_name, currency_code, visibility, is_active, cadence, start_time, end_time, trust_score
"#;

#[async_trait]
impl OrderStore for PgOrderStore {
    // ========== REFERENCE DATA ==========

    async fn networks(&self) -> AppResult<Vec<Network>> {
        Ok(sqlx::query_as::<_, Network>(
            r#"
            SELECT id, identifier, chain_id, rpc_endpoint, gateway_contract_address, is_testnet, fee
            FROM networks
            ORDER BY identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn token(&self, id: Uuid) -> AppResult<Option<Token>> {
        Ok(sqlx::query_as::<_, Token>(
            "SELECT id, symbol, contract_address, decimals, network, is_enabled FROM tokens WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn token_by_address(&self, network: &str, contract: &str) -> AppResult<Option<Token>> {
        Ok(sqlx::query_as::<_, Token>(
            r#"
            SELECT id, symbol, contract_address, decimals, network, is_enabled
            FROM tokens
            WHERE network = $1 AND LOWER(contract_address) = LOWER($2)
            "#,
        )
        .bind(network)
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn fiat_currency(&self, code: &str) -> AppResult<Option<FiatCurrency>> {
        Ok(sqlx::query_as::<_, FiatCurrency>(
            "SELECT id, code, short_name, decimals, market_rate, is_enabled FROM fiat_currencies WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn enabled_fiat_currencies(&self) -> AppResult<Vec<FiatCurrency>> {
        Ok(sqlx::query_as::<_, FiatCurrency>(
            "SELECT id, code, short_name, decimals, market_rate, is_enabled FROM fiat_currencies WHERE is_enabled",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn institution(&self, code: &str) -> AppResult<Option<Institution>> {
        Ok(sqlx::query_as::<_, Institution>(
            "SELECT code, name, currency_code FROM institutions WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn sender_profile(&self, id: Uuid) -> AppResult<Option<SenderProfile>> {
        Ok(sqlx::query_as::<_, SenderProfile>(
            "SELECT id, webhook_url, webhook_secret FROM sender_profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    // ========== ORDER LOOKUPS ==========

    async fn payment_order(&self, id: Uuid) -> AppResult<Option<PaymentOrder>> {
        let sql = format!("SELECT {PAYMENT_ORDER_COLUMNS} FROM payment_orders po WHERE po.id = $1");
        Ok(sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn payment_order_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> AppResult<Option<PaymentOrder>> {
        let sql = format!(
            "SELECT {PAYMENT_ORDER_COLUMNS} FROM payment_orders po WHERE po.gateway_id = $1"
        );
        Ok(sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(gateway_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn receive_address(&self, id: Uuid) -> AppResult<Option<ReceiveAddress>> {
        Ok(sqlx::query_as::<_, ReceiveAddress>(
            r#"
            SELECT id, address, status, tx_hash, last_indexed_block, last_used, valid_until
            FROM receive_addresses
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn lock_order(&self, id: Uuid) -> AppResult<Option<LockPaymentOrder>> {
        let sql = format!("SELECT {LOCK_ORDER_COLUMNS} FROM lock_payment_orders lo WHERE lo.id = $1");
        Ok(sqlx::query_as::<_, LockPaymentOrder>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn lock_orders_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        let sql = format!(
            "SELECT {LOCK_ORDER_COLUMNS} FROM lock_payment_orders lo WHERE lo.gateway_id = $1"
        );
        Ok(sqlx::query_as::<_, LockPaymentOrder>(&sql)
            .bind(gateway_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn lock_order_exists(&self, tx_hash: &str, gateway_id: &str) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM lock_payment_orders WHERE tx_hash = $1 OR gateway_id = $2)",
        )
        .bind(tx_hash)
        .bind(gateway_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    // ========== PROVIDERS ==========

    async fn provision_bucket(&self, id: Uuid) -> AppResult<Option<ProvisionBucket>> {
        Ok(sqlx::query_as::<_, ProvisionBucket>(
            "SELECT id, min_amount, max_amount, currency_code FROM provision_buckets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn provision_buckets(&self, currency_code: &str) -> AppResult<Vec<ProvisionBucket>> {
        Ok(sqlx::query_as::<_, ProvisionBucket>(
            r#"
            SELECT id, min_amount, max_amount, currency_code
            FROM provision_buckets
            WHERE currency_code = $1
            ORDER BY max_amount DESC
            "#,
        )
        .bind(currency_code)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn all_provision_buckets(&self) -> AppResult<Vec<ProvisionBucket>> {
        Ok(sqlx::query_as::<_, ProvisionBucket>(
            "SELECT id, min_amount, max_amount, currency_code FROM provision_buckets",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn provider(&self, id: &str) -> AppResult<Option<ProviderProfile>> {
        let sql = format!("SELECT {PROVIDER_COLUMNS} FROM provider_profiles WHERE id = $1");
        let rows = sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.hydrate_providers(rows).await?.into_iter().next())
    }

    async fn bucket_providers(&self, bucket_id: Uuid) -> AppResult<Vec<ProviderProfile>> {
        let sql = format!(
            r#"
            SELECT {PROVIDER_COLUMNS}
            FROM provider_profiles
            WHERE is_active
              AND visibility = 'public'
              AND id IN (SELECT provider_id FROM provider_buckets WHERE bucket_id = $1)
            "#
        );
        let rows = sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(bucket_id)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_providers(rows).await
    }

    async fn currency_providers(&self, currency_code: &str) -> AppResult<Vec<ProviderProfile>> {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_profiles WHERE is_active AND currency_code = $1"
        );
        let rows = sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(currency_code)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_providers(rows).await
    }

    // ========== RECONCILIATION QUERIES ==========

    async fn orders_awaiting_deposit(&self, network: &str) -> AppResult<Vec<PaymentOrder>> {
        let sql = format!(
            r#"
            SELECT {PAYMENT_ORDER_COLUMNS}
            FROM payment_orders po
            JOIN tokens t ON t.id = po.token_id
            JOIN receive_addresses ra ON ra.id = po.receive_address_id
            WHERE po.status = 'initiated'
              AND t.network = $1
              AND ra.status IN ('unused', 'partial')
            "#
        );
        Ok(sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(network)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn orders_pending_creation(
        &self,
        updated_since: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentOrder>> {
        self.payment_orders_where(
            &format!(
                "po.status = 'initiated' AND po.gateway_id IS NULL AND ra.status = 'used' \
                 AND po.updated_at >= $1 AND {FULLY_PAID}"
            ),
            updated_since,
        )
        .await
    }

    async fn orders_to_revert(&self, updated_before: DateTime<Utc>) -> AppResult<Vec<PaymentOrder>> {
        self.payment_orders_where(
            "po.status IN ('initiated', 'expired') AND po.amount_paid > 0 \
             AND po.amount_returned = 0 AND po.updated_at < $1 \
             AND ra.status IN ('expired', 'used')",
            updated_before,
        )
        .await
    }

    async fn orders_with_lapsed_addresses(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentOrder>> {
        self.payment_orders_where(
            "po.status = 'initiated' AND ( \
                (ra.status IN ('unused', 'partial') AND ra.valid_until < $1) \
                OR (ra.status = 'used' AND po.amount_returned = 0 \
                    AND po.amount_paid > ROUND(po.amount + po.protocol_fee + po.sender_fee + po.network_fee, t.decimals)) \
             )",
            now,
        )
        .await
    }

    async fn lock_orders_to_settle(
        &self,
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        self.lock_orders_where(
            "lo.status = 'validated' AND lo.updated_at < $1 AND EXISTS ( \
                SELECT 1 FROM lock_order_fulfillments f \
                WHERE f.lock_order_id = lo.id AND f.validation_status = 'success')",
            None,
            Some(updated_before),
        )
        .await
    }

    async fn lock_orders_to_refund(
        &self,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        self.lock_orders_where(
            "lo.created_at <= $1 AND ( \
                lo.status IN ('pending', 'cancelled') \
                OR (lo.status = 'validated' AND NOT EXISTS ( \
                    SELECT 1 FROM lock_order_fulfillments f \
                    WHERE f.lock_order_id = lo.id AND f.validation_status = 'success')))",
            None,
            Some(created_before),
        )
        .await
    }

    async fn lock_orders_awaiting_settlement_event(
        &self,
        network: &str,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        self.lock_orders_where(
            "lo.network = $1 AND (lo.status = 'validated' \
                OR (lo.status = 'settled' AND po.status = 'pending'))",
            Some(network),
            None,
        )
        .await
    }

    async fn lock_orders_awaiting_refund_event(
        &self,
        network: &str,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        self.lock_orders_where(
            "lo.network = $1 AND ((lo.status = 'pending' AND lo.created_at <= $2) \
                OR (lo.status = 'refunded' AND po.status = 'pending'))",
            Some(network),
            Some(created_before),
        )
        .await
    }

    async fn pending_lock_orders(
        &self,
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        self.lock_orders_where(
            "lo.status = 'pending' AND lo.updated_at < $1",
            None,
            Some(updated_before),
        )
        .await
    }

    async fn due_webhook_attempts(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<WebhookRetryAttempt>> {
        Ok(sqlx::query_as::<_, WebhookRetryAttempt>(
            r#"
            SELECT id, attempt_number, next_retry_time, payload, signature, webhook_url,
                   status, created_at, updated_at
            FROM webhook_retry_attempts
            WHERE status = 'failed' AND next_retry_time <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    // ========== UNITS OF WORK ==========

    async fn record_deposit(&self, deposit: DepositRecord) -> AppResult<Option<PaymentOrder>> {
        let mut tx = self.begin_tx().await?;

        let seen: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transaction_logs
                WHERE status = 'crypto_deposited' AND tx_hash = $1
            )
            "#,
        )
        .bind(&deposit.tx_hash)
        .fetch_one(&mut *tx)
        .await?;
        if seen {
            debug!("Deposit {} already recorded", deposit.tx_hash);
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE receive_addresses
            SET status = $2, tx_hash = $3, last_used = NOW(), last_indexed_block = $4
            WHERE id = $1
            "#,
        )
        .bind(deposit.receive_address_id)
        .bind(deposit.address_status)
        .bind(&deposit.tx_hash)
        .bind(deposit.block_number)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            r#"
            UPDATE payment_orders po
            SET amount_paid = po.amount_paid + $2,
                from_address = $3,
                return_address = COALESCE(po.return_address, $3),
                tx_hash = $4,
                block_number = $5,
                amount = COALESCE($6, po.amount),
                rate = COALESCE($7, po.rate),
                updated_at = NOW()
            WHERE po.id = $1
            RETURNING {PAYMENT_ORDER_COLUMNS}
            "#
        );
        let order = sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(deposit.order_id)
            .bind(deposit.value)
            .bind(&deposit.from_address)
            .bind(&deposit.tx_hash)
            .bind(deposit.block_number)
            .bind(deposit.amount_override)
            .bind(deposit.rate_override)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(order) = order else {
            return Ok(None);
        };

        Self::insert_log(
            &mut tx,
            TransactionStatus::CryptoDeposited,
            &deposit.network,
            &deposit.tx_hash,
            None,
            serde_json::json!({
                "from": deposit.from_address,
                "value": deposit.value.to_string(),
                "block_number": deposit.block_number,
            }),
            Some(order.id),
            None,
        )
        .await?;

        tx.commit().await?;
        info!("💰 Recorded deposit {} for order {}", deposit.tx_hash, order.id);
        Ok(Some(order))
    }

    async fn create_lock_orders(
        &self,
        orders: Vec<NewLockOrder>,
        log: OrderCreatedLog,
    ) -> AppResult<Vec<LockPaymentOrder>> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.begin_tx().await?;

        // Serializes overlapping indexer runs on the same gateway order
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&log.gateway_id)
            .execute(&mut *tx)
            .await?;

        let duplicate: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM lock_payment_orders WHERE tx_hash = $1 OR gateway_id = $2)",
        )
        .bind(&log.tx_hash)
        .bind(&log.gateway_id)
        .fetch_one(&mut *tx)
        .await?;
        if duplicate {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(orders.len());
        for order in orders {
            let order = order.into_lock_order(now);
            sqlx::query(
                r#"
                INSERT INTO lock_payment_orders
                    (id, gateway_id, amount, rate, order_percent, tx_hash, status, block_number,
                     token_id, network, institution, account_identifier, account_name, memo,
                     provider_id, provision_bucket_id, cancellation_count, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                "#,
            )
            .bind(order.id)
            .bind(&order.gateway_id)
            .bind(order.amount)
            .bind(order.rate)
            .bind(order.order_percent)
            .bind(&order.tx_hash)
            .bind(order.status)
            .bind(order.block_number)
            .bind(order.token_id)
            .bind(&order.network)
            .bind(&order.institution)
            .bind(&order.account_identifier)
            .bind(&order.account_name)
            .bind(&order.memo)
            .bind(&order.provider_id)
            .bind(order.provision_bucket_id)
            .bind(order.cancellation_count)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await?;
            created.push(order);
        }

        let payment_order_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE payment_orders
            SET gateway_id = $2, block_number = $3, status = 'pending', updated_at = NOW()
            WHERE tx_hash = $1 AND gateway_id IS NULL
            RETURNING id
            "#,
        )
        .bind(&log.tx_hash)
        .bind(&log.gateway_id)
        .bind(log.block_number)
        .fetch_optional(&mut *tx)
        .await?;

        let logged = Self::insert_log(
            &mut tx,
            TransactionStatus::OrderCreated,
            &log.network,
            &log.tx_hash,
            Some(&log.gateway_id),
            log.metadata,
            payment_order_id,
            created.first().map(|o| o.id),
        )
        .await;
        match logged {
            Err(e) if is_unique_violation(&e) => {
                debug!("Gateway order {} was indexed concurrently", log.gateway_id);
                return Ok(Vec::new());
            }
            other => other?,
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn apply_order_settled(&self, update: SettlementUpdate) -> AppResult<SettlementOutcome> {
        let mut tx = self.begin_tx().await?;

        let lock_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE lock_payment_orders
            SET status = 'settled', updated_at = NOW()
            WHERE id = $1 AND status <> 'settled'
            RETURNING id
            "#,
        )
        .bind(update.split_order_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(lock_id) = lock_id else {
            return Ok(SettlementOutcome::default());
        };

        // LEAST keeps the percentage capped; the status flips only at 100
        let sql = format!(
            r#"
            UPDATE payment_orders po
            SET percent_settled = LEAST(100, po.percent_settled + $2),
                status = CASE WHEN po.percent_settled + $2 >= 100
                              THEN 'settled'::payment_order_status ELSE po.status END,
                updated_at = NOW()
            WHERE po.gateway_id = $1 AND po.status <> 'settled'
            RETURNING {PAYMENT_ORDER_COLUMNS}
            "#
        );
        let mut payment_order = sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(&update.gateway_id)
            .bind(update.settle_percent)
            .fetch_optional(&mut *tx)
            .await?;
        if payment_order.is_none() {
            let sql = format!(
                "SELECT {PAYMENT_ORDER_COLUMNS} FROM payment_orders po WHERE po.gateway_id = $1"
            );
            payment_order = sqlx::query_as::<_, PaymentOrder>(&sql)
                .bind(&update.gateway_id)
                .fetch_optional(&mut *tx)
                .await?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE transaction_logs
            SET tx_hash = $2, lock_order_id = $3
            WHERE status = 'order_settled' AND gateway_id = $1
            "#,
        )
        .bind(&update.gateway_id)
        .bind(&update.tx_hash)
        .bind(lock_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            Self::insert_log(
                &mut tx,
                TransactionStatus::OrderSettled,
                &update.network,
                &update.tx_hash,
                Some(&update.gateway_id),
                serde_json::json!({
                    "liquidity_provider": update.liquidity_provider,
                    "settle_percent": update.settle_percent.to_string(),
                    "block_number": update.block_number,
                }),
                payment_order.as_ref().map(|o| o.id),
                Some(lock_id),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(SettlementOutcome {
            applied: true,
            payment_order,
        })
    }

    async fn apply_order_refunded(&self, update: RefundUpdate) -> AppResult<Option<PaymentOrder>> {
        let mut tx = self.begin_tx().await?;

        let refunded: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE lock_payment_orders
            SET status = 'refunded', updated_at = NOW()
            WHERE gateway_id = $1 AND status <> 'refunded'
            RETURNING id
            "#,
        )
        .bind(&update.gateway_id)
        .fetch_all(&mut *tx)
        .await?;

        let sql = format!(
            r#"
            UPDATE payment_orders po
            SET status = 'refunded', updated_at = NOW()
            WHERE po.gateway_id = $1 AND po.status NOT IN ('refunded', 'settled')
            RETURNING {PAYMENT_ORDER_COLUMNS}
            "#
        );
        let payment_order = sqlx::query_as::<_, PaymentOrder>(&sql)
            .bind(&update.gateway_id)
            .fetch_optional(&mut *tx)
            .await?;

        if !refunded.is_empty() || payment_order.is_some() {
            Self::insert_log(
                &mut tx,
                TransactionStatus::OrderRefunded,
                &update.network,
                &update.tx_hash,
                Some(&update.gateway_id),
                serde_json::json!({
                    "fee": update.fee.to_string(),
                    "block_number": update.block_number,
                }),
                payment_order.as_ref().map(|o| o.id),
                refunded.first().copied(),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(payment_order)
    }

    async fn expire_order(&self, order_id: Uuid) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let address_id: Option<Option<Uuid>> = sqlx::query_scalar(
            r#"
            UPDATE payment_orders
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1 AND status = 'initiated'
            RETURNING receive_address_id
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(address_id) = address_id else {
            return Ok(false);
        };

        if let Some(address_id) = address_id {
            sqlx::query("UPDATE receive_addresses SET status = 'expired' WHERE id = $1")
                .bind(address_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn extend_receive_address(
        &self,
        address_id: Uuid,
        valid_until: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE receive_addresses SET valid_until = $2 WHERE id = $1")
            .bind(address_id)
            .bind(valid_until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_retry_attempts
                (id, attempt_number, next_retry_time, payload, signature, webhook_url,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.attempt_number)
        .bind(attempt.next_retry_time)
        .bind(&attempt.payload)
        .bind(&attempt.signature)
        .bind(&attempt.webhook_url)
        .bind(attempt.status)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_webhook_attempt(&self, attempt: &WebhookRetryAttempt) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_retry_attempts
            SET attempt_number = $2, next_retry_time = $3, status = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.attempt_number)
        .bind(attempt.next_retry_time)
        .bind(attempt.status)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_fiat_market_rate(&self, code: &str, rate: Decimal) -> AppResult<()> {
        sqlx::query("UPDATE fiat_currencies SET market_rate = $2 WHERE code = $1")
            .bind(code)
            .bind(rate)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
