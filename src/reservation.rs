use std::sync::Arc;
use tracing::{info, warn};

use crate::error::PayResult;
use crate::store::models::LineItem;
use crate::store::repository::PaymentStorage;
use crate::store::RetryPolicy;

/// Release side of the inventory reservation ledger. Holds are acquired by
/// the basket subsystem; the payment core only ever decrements them, once
/// per terminal order resolution.
///
/// A failed release is logged, not propagated: the periodic basket-expiry
/// sweep re-derives hold counts independently, so this release is an
/// optimization rather than the sole source of truth for hold integrity.
/// Exactly-once is enforced by the caller (the settlement guard), not here;
/// the decrement itself is clamped at zero so a double release is a no-op.
pub struct ReservationLedger {
    store: Arc<dyn PaymentStorage>,
    retry: RetryPolicy,
}

impl ReservationLedger {
    pub fn new(store: Arc<dyn PaymentStorage>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn release(&self, line_items: &[LineItem]) {
        if line_items.is_empty() {
            return;
        }

        let mut released = 0usize;
        for item in line_items {
            let result: PayResult<()> = self
                .retry
                .run("reservation release", || {
                    let store = self.store.clone();
                    let product_ref = item.product_ref;
                    async move { store.decrement_hold(product_ref).await }
                })
                .await;

            match result {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(
                        "⚠️ Could not release hold for product {} (basket sweep will correct): {}",
                        item.product_ref, e
                    );
                }
            }
        }

        info!("🔓 Released {}/{} inventory holds", released, line_items.len());
    }
}
