use std::sync::Arc;

use solana_sdk::signature::{Keypair, Signer};
use tracing::info;

use crate::chain::encode_keypair;
use crate::error::PayResult;
use crate::oracle::PriceOracle;
use crate::store::models::{compute_expected_amount, NewOrder, PaymentInstructions};
use crate::store::repository::PaymentStorage;

/// Mints one single-use deposit wallet per order and snapshots the order
/// itself. Issuance is idempotent on `order_id`: a retried request gets the
/// wallet minted the first time, never a second keypair.
pub struct WalletIssuer {
    store: Arc<dyn PaymentStorage>,
    oracle: Arc<PriceOracle>,
    asset_code: String,
}

impl WalletIssuer {
    pub fn new(
        store: Arc<dyn PaymentStorage>,
        oracle: Arc<PriceOracle>,
        asset_code: &str,
    ) -> Self {
        Self {
            store,
            oracle,
            asset_code: asset_code.to_string(),
        }
    }

    /// Create the pending order record and its deposit wallet, returning
    /// what the caller shows the user.
    ///
    /// Fails fast with `PriceUnavailable` or a database error; no partial
    /// wallet is handed out on failure.
    pub async fn issue(&self, new_order: NewOrder) -> PayResult<PaymentInstructions> {
        let price = self.oracle.spot_price().await?;

        // Idempotency: a wallet already minted for this order wins.
        if let Some(existing) = self.store.find_wallet_by_order(&new_order.order_id).await? {
            info!(
                "Found existing deposit wallet for order {}",
                new_order.order_id
            );
            return Ok(PaymentInstructions {
                pay_address: existing.public_key,
                pay_amount: existing.expected_amount,
                asset_code: self.asset_code.clone(),
                exchange_rate: price,
                order_id: new_order.order_id,
            });
        }

        // Round-down at the same precision the settlement tolerance
        // comparison uses.
        let expected = compute_expected_amount(new_order.target_fiat_amount, price);

        let keypair = Keypair::new();
        let public_key = keypair.pubkey().to_string();
        let private_key = encode_keypair(&keypair);

        self.store
            .insert_order(&new_order, &self.asset_code, expected)
            .await?;

        // The UNIQUE constraint on order_id backstops the idempotency check
        // against a concurrent duplicate request: the loser re-reads the
        // winner's wallet instead of surfacing the conflict.
        let wallet = match self
            .store
            .insert_wallet(
                &new_order.order_id,
                new_order.user_id,
                &public_key,
                &private_key,
                expected,
            )
            .await
        {
            Ok(wallet) => wallet,
            Err(e) => match self.store.find_wallet_by_order(&new_order.order_id).await? {
                Some(existing) => existing,
                None => return Err(e),
            },
        };

        info!(
            "🪪 Issued deposit wallet {} for order {} ({} {} expected)",
            wallet.public_key, new_order.order_id, expected, self.asset_code
        );

        Ok(PaymentInstructions {
            pay_address: wallet.public_key,
            pay_amount: expected,
            asset_code: self.asset_code.clone(),
            exchange_rate: price,
            order_id: new_order.order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PayError;
    use crate::oracle::DurablePriceCache;
    use crate::store::models::{Order, OrderKind, Wallet, WalletStatus};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FixedPrice;

    #[async_trait]
    impl DurablePriceCache for FixedPrice {
        async fn load(&self) -> Option<(Decimal, DateTime<Utc>)> {
            Some((dec!(100), Utc::now()))
        }

        async fn save(&self, _price: Decimal) {}
    }

    fn oracle() -> Arc<PriceOracle> {
        Arc::new(PriceOracle::with_sources("SOL", "EUR", vec![], Arc::new(FixedPrice)))
    }

    fn wallet_for(order_id: &str, public_key: &str) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            user_id: 7,
            public_key: public_key.to_string(),
            private_key: "[]".to_string(),
            expected_amount: dec!(0.1),
            received_amount: dec!(0),
            status: WalletStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Scripted `find_wallet_by_order` results plus a switch that makes
    /// `insert_wallet` lose a unique-constraint race.
    struct ScriptedStore {
        finds: Mutex<VecDeque<Option<Wallet>>>,
        insert_wallet_fails: bool,
        order_inserts: AtomicU32,
    }

    impl ScriptedStore {
        fn new(finds: Vec<Option<Wallet>>, insert_wallet_fails: bool) -> Arc<Self> {
            Arc::new(Self {
                finds: Mutex::new(finds.into()),
                insert_wallet_fails,
                order_inserts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentStorage for ScriptedStore {
        async fn insert_order(
            &self,
            _new_order: &NewOrder,
            _asset_code: &str,
            _expected_asset_amount: Decimal,
        ) -> crate::error::PayResult<()> {
            self.order_inserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_order(&self, _order_id: &str) -> crate::error::PayResult<Option<Order>> {
            Ok(None)
        }

        async fn delete_order(&self, _order_id: &str) -> crate::error::PayResult<bool> {
            Ok(false)
        }

        async fn insert_wallet(
            &self,
            order_id: &str,
            user_id: i64,
            public_key: &str,
            private_key: &str,
            expected_amount: Decimal,
        ) -> crate::error::PayResult<Wallet> {
            if self.insert_wallet_fails {
                return Err(PayError::Internal("duplicate key value".into()));
            }
            Ok(Wallet {
                id: Uuid::new_v4(),
                order_id: order_id.to_string(),
                user_id,
                public_key: public_key.to_string(),
                private_key: private_key.to_string(),
                expected_amount,
                received_amount: dec!(0),
                status: WalletStatus::Pending,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        }

        async fn find_wallet_by_order(
            &self,
            _order_id: &str,
        ) -> crate::error::PayResult<Option<Wallet>> {
            Ok(self.finds.lock().unwrap().pop_front().flatten())
        }

        async fn transition_from_pending(
            &self,
            _wallet_id: Uuid,
            _new_status: WalletStatus,
            _received_amount: Option<Decimal>,
        ) -> crate::error::PayResult<bool> {
            Ok(false)
        }

        async fn decrement_hold(&self, _product_ref: i64) -> crate::error::PayResult<()> {
            Ok(())
        }
    }

    fn refill_order(order_id: &str) -> NewOrder {
        NewOrder {
            order_id: order_id.to_string(),
            user_id: 7,
            target_fiat_amount: dec!(10.00),
            kind: OrderKind::Refill,
            line_items: None,
            discount_ref: None,
        }
    }

    #[tokio::test]
    async fn repeated_request_returns_the_existing_wallet() {
        let existing = wallet_for("order-1", "ExistingPubkey111");
        let store = ScriptedStore::new(vec![Some(existing)], false);
        let issuer = WalletIssuer::new(store.clone(), oracle(), "SOL");

        let instructions = issuer.issue(refill_order("order-1")).await.unwrap();

        assert_eq!(instructions.pay_address, "ExistingPubkey111");
        assert_eq!(instructions.pay_amount, dec!(0.1));
        // No second order snapshot, no second keypair.
        assert_eq!(store.order_inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn losing_a_concurrent_duplicate_serves_the_winners_wallet() {
        // First lookup misses, the insert hits the unique constraint, and
        // the re-read finds the wallet the concurrent request minted.
        let winner = wallet_for("order-2", "WinnerPubkey111");
        let store = ScriptedStore::new(vec![None, Some(winner)], true);
        let issuer = WalletIssuer::new(store.clone(), oracle(), "SOL");

        let instructions = issuer.issue(refill_order("order-2")).await.unwrap();

        assert_eq!(instructions.pay_address, "WinnerPubkey111");
    }

    #[tokio::test]
    async fn insert_failure_without_a_winner_propagates() {
        let store = ScriptedStore::new(vec![None, None], true);
        let issuer = WalletIssuer::new(store, oracle(), "SOL");

        assert!(issuer.issue(refill_order("order-3")).await.is_err());
    }

    #[tokio::test]
    async fn fresh_order_quotes_at_spot() {
        let store = ScriptedStore::new(vec![None], false);
        let issuer = WalletIssuer::new(store.clone(), oracle(), "SOL");

        let instructions = issuer.issue(refill_order("order-4")).await.unwrap();

        // 10.00 EUR at 100 EUR/SOL
        assert_eq!(instructions.pay_amount, dec!(0.1));
        assert_eq!(instructions.exchange_rate, dec!(100));
        assert_eq!(store.order_inserts.load(Ordering::SeqCst), 1);
    }
}
