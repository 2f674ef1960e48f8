use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use crate::error::PayResult;
use crate::hooks::StorefrontHooks;
use crate::oracle::PriceOracle;
use crate::reservation::ReservationLedger;
use crate::scanner::ScanOutcome;
use crate::store::models::{quantize_fiat, Order, OrderKind, Wallet, WalletStatus};
use crate::store::repository::PaymentStorage;
use crate::sweep::FundSweeper;

/// Overpayment below this is treated as dust and not credited back.
const OVERPAY_DUST: Decimal = dec!(0.0005);

/// Surplus worth crediting back to the user, if any.
pub fn creditable_overpayment(observed: Decimal, expected: Decimal) -> Option<Decimal> {
    let surplus = observed - expected;
    (surplus > OVERPAY_DUST).then_some(surplus)
}

/// Exactly-once transition of one wallet/order pair out of `pending`.
///
/// The enforcement point is the conditional status update inside one
/// storage transaction: whichever caller (scanner, recovery pass, retried
/// trigger) commits the pending -> terminal flip first runs the side
/// effects; everyone else sees `rows_affected = 0` and backs off silently.
/// Side effects run after the commit so their failure can never undo the
/// payment record.
pub struct SettlementEngine {
    store: Arc<dyn PaymentStorage>,
    oracle: Arc<PriceOracle>,
    reservations: Arc<ReservationLedger>,
    hooks: Arc<dyn StorefrontHooks>,
    sweeper: Option<Arc<FundSweeper>>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn PaymentStorage>,
        oracle: Arc<PriceOracle>,
        reservations: Arc<ReservationLedger>,
        hooks: Arc<dyn StorefrontHooks>,
        sweeper: Option<Arc<FundSweeper>>,
    ) -> Self {
        Self {
            store,
            oracle,
            reservations,
            hooks,
            sweeper,
        }
    }

    pub async fn settle(&self, wallet: &Wallet, outcome: ScanOutcome) -> PayResult<()> {
        match outcome {
            ScanOutcome::Paid { observed } => self.settle_paid(wallet, observed).await,
            ScanOutcome::Underpaid { observed } => self.settle_underpaid(wallet, observed).await,
            ScanOutcome::Expired => self.settle_expired(wallet).await,
            ScanOutcome::NoActivity => Ok(()),
        }
    }

    async fn settle_paid(&self, wallet: &Wallet, observed: Decimal) -> PayResult<()> {
        if !self
            .store
            .transition_from_pending(wallet.id, WalletStatus::Paid, Some(observed))
            .await?
        {
            info!("Order {} already processed, skipping", wallet.order_id);
            return Ok(());
        }

        info!("✅ Payment detected for order {}: {}", wallet.order_id, observed);

        // Overpayment surplus goes back to the user as account credit. A
        // failure here must not block delivery: the payment record is
        // already committed.
        if let Some(surplus) = creditable_overpayment(observed, wallet.expected_amount) {
            self.credit_fiat_value(
                wallet.user_id,
                surplus,
                &format!("Overpayment bonus for order {}", wallet.order_id),
            )
            .await;
        }

        match self.store.get_order(&wallet.order_id).await? {
            Some(order) => self.complete_order(&order).await,
            None => {
                // Already cleaned up by a duplicate trigger. Delivery is
                // at-most-once, so this is a no-op, never a retry.
                warn!(
                    "No pending order record for paid order {}; assuming already handled",
                    wallet.order_id
                );
            }
        }

        self.schedule_sweep(wallet, WalletStatus::Paid);
        Ok(())
    }

    async fn complete_order(&self, order: &Order) {
        match order.kind {
            OrderKind::Purchase => {
                let delivered = self
                    .hooks
                    .on_purchase_delivery(
                        order.user_id,
                        order.line_items(),
                        order.discount_ref.as_deref(),
                        &order.order_id,
                    )
                    .await;

                if let Err(e) = delivered {
                    // Keep the order row so the failure is visible to an
                    // operator; the wallet is terminal, so nothing will
                    // re-trigger delivery automatically.
                    error!(
                        "Delivery callback failed for paid order {}: {}",
                        order.order_id, e
                    );
                    return;
                }
            }
            OrderKind::Refill => {
                let credited = self
                    .hooks
                    .on_balance_credit(
                        order.user_id,
                        order.target_fiat_amount,
                        &format!("Refill {}", order.order_id),
                    )
                    .await;

                if let Err(e) = credited {
                    error!(
                        "Refill credit callback failed for order {}: {}",
                        order.order_id, e
                    );
                    return;
                }
            }
        }

        // Deleting the order is the terminal-success signal; for purchases
        // the delivery's own bookkeeping resolves the inventory holds.
        if let Err(e) = self.store.delete_order(&order.order_id).await {
            error!("Could not remove settled order {}: {}", order.order_id, e);
        }
    }

    async fn settle_underpaid(&self, wallet: &Wallet, observed: Decimal) -> PayResult<()> {
        // Resolve the refund value before taking the terminal transition:
        // with no price available the wallet stays pending and the next
        // cycle retries, instead of committing a refund we cannot price.
        let price = self.oracle.spot_price().await?;

        if !self
            .store
            .transition_from_pending(wallet.id, WalletStatus::Underpaid, Some(observed))
            .await?
        {
            return Ok(());
        }

        let refund = quantize_fiat(observed * price);
        info!(
            "📉 Underpayment on order {} ({} received), crediting {} back",
            wallet.order_id, observed, refund
        );

        if refund > Decimal::ZERO {
            if let Err(e) = self
                .hooks
                .on_balance_credit(
                    wallet.user_id,
                    refund,
                    &format!("Underpayment refund {}", wallet.order_id),
                )
                .await
            {
                error!("Underpayment credit failed for order {}: {}", wallet.order_id, e);
            }
        }

        let message = format!(
            "⚠️ Underpayment detected ({} received). {} was credited to your balance; please use Top Up.",
            observed, refund
        );
        if let Err(e) = self.hooks.on_notify_user(wallet.user_id, &message).await {
            warn!("Could not notify user {}: {}", wallet.user_id, e);
        }

        self.terminate_order(&wallet.order_id).await?;
        self.schedule_sweep(wallet, WalletStatus::Underpaid);
        Ok(())
    }

    async fn settle_expired(&self, wallet: &Wallet) -> PayResult<()> {
        if !self
            .store
            .transition_from_pending(wallet.id, WalletStatus::Expired, None)
            .await?
        {
            return Ok(());
        }

        info!("⏱️ Order {} expired (no payment received)", wallet.order_id);
        self.terminate_order(&wallet.order_id).await
    }

    /// Explicit caller-driven cancellation: same non-success termination as
    /// expiry.
    pub async fn cancel_order(&self, order_id: &str) -> PayResult<()> {
        if let Some(wallet) = self.store.find_wallet_by_order(order_id).await? {
            if !self
                .store
                .transition_from_pending(wallet.id, WalletStatus::Expired, None)
                .await?
            {
                info!("Order {} already settled, cancel is a no-op", order_id);
                return Ok(());
            }
        }

        info!("🚫 Order {} cancelled", order_id);
        self.terminate_order(order_id).await
    }

    /// Non-success termination: release inventory holds for purchases, then
    /// drop the order row. Also re-driven by the recovery pass for orders
    /// whose wallet reached a terminal state but whose row survived a crash.
    pub(crate) async fn terminate_order(&self, order_id: &str) -> PayResult<()> {
        let order = match self.store.get_order(order_id).await? {
            Some(order) => order,
            None => return Ok(()),
        };

        if order.kind == OrderKind::Purchase {
            self.reservations.release(order.line_items()).await;
        }

        self.store.delete_order(order_id).await?;
        Ok(())
    }

    /// Convert an asset amount to fiat and credit it. Used for overpayment
    /// surpluses; failures are logged, never propagated.
    async fn credit_fiat_value(&self, user_id: i64, asset_amount: Decimal, reason: &str) {
        let price = match self.oracle.spot_price().await {
            Ok(price) => price,
            Err(e) => {
                error!("Cannot price surplus of {} for credit: {}", asset_amount, e);
                return;
            }
        };

        let fiat = quantize_fiat(asset_amount * price);
        if fiat <= Decimal::ZERO {
            return;
        }

        info!("💰 Crediting {} ({} in asset units): {}", fiat, asset_amount, reason);
        if let Err(e) = self.hooks.on_balance_credit(user_id, fiat, reason).await {
            error!("Balance credit failed for user {}: {}", user_id, e);
        }
    }

    /// Fire-and-forget sweep of the wallet's funds to the operator wallet.
    /// Sweep failure never rolls back settlement; the recovery sub-pass
    /// retries it.
    fn schedule_sweep(&self, wallet: &Wallet, settled_status: WalletStatus) {
        if let Some(sweeper) = &self.sweeper {
            let sweeper = sweeper.clone();
            let mut wallet = wallet.clone();
            wallet.status = settled_status;
            tokio::spawn(async move {
                sweeper.sweep(&wallet).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DurablePriceCache;
    use crate::store::models::{LineItem, NewOrder};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::types::Json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn overpayment_above_dust_is_credited() {
        // 0.11 received against 0.1 expected -> 0.01 surplus
        assert_eq!(
            creditable_overpayment(dec!(0.11), dec!(0.1)),
            Some(dec!(0.01))
        );
    }

    #[test]
    fn dust_overpayment_is_ignored() {
        assert_eq!(creditable_overpayment(dec!(0.1003), dec!(0.1)), None);
        assert_eq!(creditable_overpayment(dec!(0.1005), dec!(0.1)), None);
        assert_eq!(creditable_overpayment(dec!(0.1), dec!(0.1)), None);
    }

    #[test]
    fn surplus_fiat_conversion_quantizes_to_cents() {
        // 0.01 SOL at 100 EUR/SOL -> 1.00 EUR
        let surplus = creditable_overpayment(dec!(0.11), dec!(0.1)).unwrap();
        assert_eq!(quantize_fiat(surplus * dec!(100)), dec!(1.00));
    }

    #[test]
    fn underpayment_refund_value() {
        // 0.095 SOL at 100 EUR/SOL -> 9.50 EUR credited back
        assert_eq!(quantize_fiat(dec!(0.095) * dec!(100)), dec!(9.50));
    }

    // ---- engine tests against an in-memory store double ----

    /// Mirrors the conditional-update guard: the transition succeeds only
    /// while the wallet is still pending.
    #[derive(Default)]
    struct InMemoryStore {
        statuses: Mutex<HashMap<Uuid, WalletStatus>>,
        order: Mutex<Option<Order>>,
        released: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl PaymentStorage for InMemoryStore {
        async fn insert_order(
            &self,
            _new_order: &NewOrder,
            _asset_code: &str,
            _expected_asset_amount: Decimal,
        ) -> PayResult<()> {
            Ok(())
        }

        async fn get_order(&self, order_id: &str) -> PayResult<Option<Order>> {
            Ok(self
                .order
                .lock()
                .unwrap()
                .clone()
                .filter(|o| o.order_id == order_id))
        }

        async fn delete_order(&self, order_id: &str) -> PayResult<bool> {
            let mut order = self.order.lock().unwrap();
            if order.as_ref().is_some_and(|o| o.order_id == order_id) {
                *order = None;
                return Ok(true);
            }
            Ok(false)
        }

        async fn insert_wallet(
            &self,
            _order_id: &str,
            _user_id: i64,
            _public_key: &str,
            _private_key: &str,
            _expected_amount: Decimal,
        ) -> PayResult<Wallet> {
            unimplemented!("not used by the engine")
        }

        async fn find_wallet_by_order(&self, _order_id: &str) -> PayResult<Option<Wallet>> {
            Ok(None)
        }

        async fn transition_from_pending(
            &self,
            wallet_id: Uuid,
            new_status: WalletStatus,
            _received_amount: Option<Decimal>,
        ) -> PayResult<bool> {
            let mut statuses = self.statuses.lock().unwrap();
            match statuses.get_mut(&wallet_id) {
                Some(status) if *status == WalletStatus::Pending => {
                    *status = new_status;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn decrement_hold(&self, product_ref: i64) -> PayResult<()> {
            self.released.lock().unwrap().push(product_ref);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        credits: Mutex<Vec<Decimal>>,
        deliveries: AtomicU32,
        notices: AtomicU32,
    }

    #[async_trait]
    impl StorefrontHooks for RecordingHooks {
        async fn on_balance_credit(
            &self,
            _user_id: i64,
            fiat_amount: Decimal,
            _reason: &str,
        ) -> PayResult<()> {
            self.credits.lock().unwrap().push(fiat_amount);
            Ok(())
        }

        async fn on_purchase_delivery(
            &self,
            _user_id: i64,
            _line_items: &[LineItem],
            _discount_ref: Option<&str>,
            _order_id: &str,
        ) -> PayResult<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_notify_user(&self, _user_id: i64, _message: &str) -> PayResult<()> {
            self.notices.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_admin_alert(&self, _message: &str) -> PayResult<()> {
            Ok(())
        }
    }

    struct FixedPrice;

    #[async_trait]
    impl DurablePriceCache for FixedPrice {
        async fn load(&self) -> Option<(Decimal, DateTime<Utc>)> {
            Some((dec!(100), Utc::now()))
        }

        async fn save(&self, _price: Decimal) {}
    }

    fn pending_wallet(store: &InMemoryStore, order_id: &str) -> Wallet {
        let wallet = Wallet {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            user_id: 7,
            public_key: "Pubkey111".to_string(),
            private_key: "[]".to_string(),
            expected_amount: dec!(0.1),
            received_amount: dec!(0),
            status: WalletStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .statuses
            .lock()
            .unwrap()
            .insert(wallet.id, WalletStatus::Pending);
        wallet
    }

    fn purchase_order(order_id: &str, product_refs: &[i64]) -> Order {
        let items = product_refs
            .iter()
            .map(|&product_ref| LineItem {
                product_ref,
                unit_price: dec!(5.00),
                category: "digital".to_string(),
            })
            .collect();
        Order {
            order_id: order_id.to_string(),
            user_id: 7,
            target_fiat_amount: dec!(10.00),
            asset_code: "SOL".to_string(),
            expected_asset_amount: dec!(0.1),
            kind: OrderKind::Purchase,
            line_items: Some(Json(items)),
            discount_ref: None,
            created_at: Utc::now(),
        }
    }

    fn engine(
        store: &Arc<InMemoryStore>,
        hooks: &Arc<RecordingHooks>,
    ) -> SettlementEngine {
        let oracle = Arc::new(PriceOracle::with_sources(
            "SOL",
            "EUR",
            vec![],
            Arc::new(FixedPrice),
        ));
        SettlementEngine::new(
            store.clone(),
            oracle,
            Arc::new(ReservationLedger::new(store.clone())),
            hooks.clone(),
            None,
        )
    }

    #[tokio::test]
    async fn duplicate_paid_settlement_delivers_exactly_once() {
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        let wallet = pending_wallet(&store, "order-1");
        *store.order.lock().unwrap() = Some(purchase_order("order-1", &[42]));
        let engine = engine(&store, &hooks);

        let outcome = ScanOutcome::Paid { observed: dec!(0.1) };
        engine.settle(&wallet, outcome.clone()).await.unwrap();
        engine.settle(&wallet, outcome).await.unwrap();

        assert_eq!(hooks.deliveries.load(Ordering::SeqCst), 1);
        assert!(hooks.credits.lock().unwrap().is_empty());
        assert!(store.order.lock().unwrap().is_none());
        assert_eq!(
            store.statuses.lock().unwrap()[&wallet.id],
            WalletStatus::Paid
        );
    }

    #[tokio::test]
    async fn lost_transition_race_has_zero_side_effects() {
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        let wallet = pending_wallet(&store, "order-2");
        // Another settlement attempt already won.
        store
            .statuses
            .lock()
            .unwrap()
            .insert(wallet.id, WalletStatus::Paid);
        *store.order.lock().unwrap() = Some(purchase_order("order-2", &[42]));
        let engine = engine(&store, &hooks);

        engine
            .settle(&wallet, ScanOutcome::Paid { observed: dec!(0.1) })
            .await
            .unwrap();

        assert_eq!(hooks.deliveries.load(Ordering::SeqCst), 0);
        assert!(hooks.credits.lock().unwrap().is_empty());
        assert!(store.order.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_expiry_releases_each_hold_exactly_once() {
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        let wallet = pending_wallet(&store, "order-3");
        *store.order.lock().unwrap() = Some(purchase_order("order-3", &[42, 43]));
        let engine = engine(&store, &hooks);

        engine.settle(&wallet, ScanOutcome::Expired).await.unwrap();
        engine.settle(&wallet, ScanOutcome::Expired).await.unwrap();

        assert_eq!(*store.released.lock().unwrap(), vec![42, 43]);
        assert!(store.order.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn overpayment_credits_the_surplus_and_still_delivers() {
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        let wallet = pending_wallet(&store, "order-4");
        *store.order.lock().unwrap() = Some(purchase_order("order-4", &[42]));
        let engine = engine(&store, &hooks);

        engine
            .settle(&wallet, ScanOutcome::Paid { observed: dec!(0.11) })
            .await
            .unwrap();

        // 0.01 SOL surplus at 100 EUR/SOL -> 1.00 EUR credit
        assert_eq!(*hooks.credits.lock().unwrap(), vec![dec!(1.00)]);
        assert_eq!(hooks.deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn underpayment_refunds_notifies_and_releases_holds() {
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        let wallet = pending_wallet(&store, "order-5");
        *store.order.lock().unwrap() = Some(purchase_order("order-5", &[42]));
        let engine = engine(&store, &hooks);

        engine
            .settle(&wallet, ScanOutcome::Underpaid { observed: dec!(0.095) })
            .await
            .unwrap();

        // 0.095 SOL at 100 EUR/SOL -> 9.50 EUR credited back
        assert_eq!(*hooks.credits.lock().unwrap(), vec![dec!(9.50)]);
        assert_eq!(hooks.notices.load(Ordering::SeqCst), 1);
        assert_eq!(*store.released.lock().unwrap(), vec![42]);
        assert!(store.order.lock().unwrap().is_none());
        assert_eq!(
            store.statuses.lock().unwrap()[&wallet.id],
            WalletStatus::Underpaid
        );
    }

    #[tokio::test]
    async fn terminating_an_orphaned_order_releases_holds_and_drops_the_row() {
        // Wallet already terminal; only the order row survived a crash.
        let store = Arc::new(InMemoryStore::default());
        let hooks = Arc::new(RecordingHooks::default());
        *store.order.lock().unwrap() = Some(purchase_order("order-6", &[42]));
        let engine = engine(&store, &hooks);

        engine.terminate_order("order-6").await.unwrap();

        assert_eq!(*store.released.lock().unwrap(), vec![42]);
        assert!(store.order.lock().unwrap().is_none());
    }
}
