use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use crate::error::PayResult;

const WALLET_COLUMNS: &str = "id, order_id, user_id, public_key, private_key, \
     expected_amount, received_amount, status, created_at, updated_at";

const ORDER_COLUMNS: &str = "order_id, user_id, target_fiat_amount, asset_code, \
     expected_asset_amount, kind, line_items, discount_ref, created_at";

/// Storage operations the order lifecycle depends on: issuance, the
/// settlement transition, and hold release. `PaymentStore` is the Postgres
/// implementation; tests substitute an in-memory double to drive the
/// lost-race and duplicate-trigger paths deterministically.
#[async_trait]
pub trait PaymentStorage: Send + Sync {
    async fn insert_order(
        &self,
        new_order: &NewOrder,
        asset_code: &str,
        expected_asset_amount: Decimal,
    ) -> PayResult<()>;

    async fn get_order(&self, order_id: &str) -> PayResult<Option<Order>>;

    /// Remove the order row. Returns false when it was already gone, which
    /// is the duplicate-trigger no-op path, not an error.
    async fn delete_order(&self, order_id: &str) -> PayResult<bool>;

    async fn insert_wallet(
        &self,
        order_id: &str,
        user_id: i64,
        public_key: &str,
        private_key: &str,
        expected_amount: Decimal,
    ) -> PayResult<Wallet>;

    async fn find_wallet_by_order(&self, order_id: &str) -> PayResult<Option<Wallet>>;

    /// Atomic pending -> terminal transition. Returns false when the wallet
    /// was no longer pending, i.e. another settlement attempt (scanner vs.
    /// recovery, or a retried trigger) already won the race. Everything a
    /// caller does after a `true` therefore runs at most once per wallet.
    async fn transition_from_pending(
        &self,
        wallet_id: Uuid,
        new_status: WalletStatus,
        received_amount: Option<Decimal>,
    ) -> PayResult<bool>;

    /// Clamped decrement of one hold count. The `hold_count > 0` condition
    /// makes a double release a safe no-op instead of driving the count
    /// negative.
    async fn decrement_hold(&self, product_ref: i64) -> PayResult<()>;
}

/// All SQL for the payment core lives here. The wallet status transition is
/// the single enforcement point for exactly-once settlement: a conditional
/// `UPDATE ... WHERE status = 'pending'` inside one transaction.
pub struct PaymentStore {
    pub pool: PgPool,
}

impl PaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== SCAN & RECOVERY QUERIES ==========

    /// Orders created before `cutoff`, oldest first. Used by the recovery
    /// pass to find settlements that may have crashed mid-flight.
    pub async fn orders_older_than(&self, cutoff: DateTime<Utc>) -> PayResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders WHERE created_at < $1 ORDER BY created_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    pub async fn count_orders_created_since(&self, since: DateTime<Utc>) -> PayResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_orders WHERE created_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn wallets_with_status(&self, status: WalletStatus) -> PayResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM deposit_wallets WHERE status = $1 ORDER BY created_at"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(wallets)
    }

    /// Settled wallets whose funds have not been moved out yet, paid and
    /// underpaid alike. Feeds the sweep-retry sub-pass.
    pub async fn wallets_awaiting_sweep(&self) -> PayResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM deposit_wallets \
             WHERE status IN ('paid', 'underpaid') ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(wallets)
    }

    /// Mark a settled wallet as swept. Conditional on the current status so
    /// a retried sweep is a no-op.
    pub async fn mark_swept(&self, wallet_id: Uuid) -> PayResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deposit_wallets
            SET status = 'swept', updated_at = now()
            WHERE id = $1 AND status IN ('paid', 'underpaid')
            "#,
        )
        .bind(wallet_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_stuck_pending(&self, older_than: DateTime<Utc>) -> PayResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deposit_wallets WHERE status = 'pending' AND created_at < $1",
        )
        .bind(older_than)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // ========== SETTINGS (DURABLE PRICE CACHE) ==========

    pub async fn get_setting(&self, key: &str) -> PayResult<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT setting_value, updated_at FROM bot_settings WHERE setting_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> PayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_settings (setting_key, setting_value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (setting_key)
            DO UPDATE SET setting_value = EXCLUDED.setting_value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== OUTBOX ==========

    /// Record an event for the bot process to drain and act on.
    pub async fn insert_outbox(
        &self,
        event_type: &str,
        user_id: Option<i64>,
        payload: serde_json::Value,
    ) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO payment_outbox (event_type, user_id, payload) VALUES ($1, $2, $3)",
        )
        .bind(event_type)
        .bind(user_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        info!("📨 Outbox event recorded: {}", event_type);
        Ok(())
    }
}

#[async_trait]
impl PaymentStorage for PaymentStore {
    async fn insert_order(
        &self,
        new_order: &NewOrder,
        asset_code: &str,
        expected_asset_amount: Decimal,
    ) -> PayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_orders
                (order_id, user_id, target_fiat_amount, asset_code,
                 expected_asset_amount, kind, line_items, discount_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(&new_order.order_id)
        .bind(new_order.user_id)
        .bind(new_order.target_fiat_amount)
        .bind(asset_code)
        .bind(expected_asset_amount)
        .bind(new_order.kind)
        .bind(new_order.line_items.clone().map(Json))
        .bind(&new_order.discount_ref)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> PayResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn delete_order(&self, order_id: &str) -> PayResult<bool> {
        let result = sqlx::query("DELETE FROM pending_orders WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_wallet(
        &self,
        order_id: &str,
        user_id: i64,
        public_key: &str,
        private_key: &str,
        expected_amount: Decimal,
    ) -> PayResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            INSERT INTO deposit_wallets
                (order_id, user_id, public_key, private_key, expected_amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(user_id)
        .bind(public_key)
        .bind(private_key)
        .bind(expected_amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn find_wallet_by_order(&self, order_id: &str) -> PayResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {WALLET_COLUMNS} FROM deposit_wallets WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn transition_from_pending(
        &self,
        wallet_id: Uuid,
        new_status: WalletStatus,
        received_amount: Option<Decimal>,
    ) -> PayResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE deposit_wallets
            SET status = $2,
                received_amount = COALESCE($3, received_amount),
                updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(wallet_id)
        .bind(new_status)
        .bind(received_amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Wallet {} already left pending, skipping transition", wallet_id);
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn decrement_hold(&self, product_ref: i64) -> PayResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservation_holds
            SET hold_count = hold_count - 1
            WHERE product_ref = $1 AND hold_count > 0
            "#,
        )
        .bind(product_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("No active hold to release for product {}", product_ref);
        }

        Ok(())
    }
}
