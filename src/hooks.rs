use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

use crate::error::PayResult;
use crate::store::models::LineItem;
use crate::store::repository::PaymentStore;

/// Callbacks the payment core invokes on the storefront side. The core owns
/// payment state; everything user-facing (crediting a balance, delivering
/// purchased items, chat messages) is the caller's job.
///
/// Delivery is at-most-once: the core never retries a delivery callback, so
/// implementations do not need their own dedup.
#[async_trait]
pub trait StorefrontHooks: Send + Sync {
    /// Credit `fiat_amount` to the user's account balance.
    async fn on_balance_credit(
        &self,
        user_id: i64,
        fiat_amount: Decimal,
        reason: &str,
    ) -> PayResult<()>;

    /// Deliver the purchased line items for a successfully paid order.
    async fn on_purchase_delivery(
        &self,
        user_id: i64,
        line_items: &[LineItem],
        discount_ref: Option<&str>,
        order_id: &str,
    ) -> PayResult<()>;

    /// Send an informational message to the user.
    async fn on_notify_user(&self, user_id: i64, message: &str) -> PayResult<()>;

    /// Raise an advisory operator alert.
    async fn on_admin_alert(&self, message: &str) -> PayResult<()>;
}

/// Hook implementation for the standalone settlement worker: every callback
/// becomes a `payment_outbox` row that the bot process drains. Keeps the
/// worker decoupled from the chat layer while preserving the callback
/// contract.
pub struct OutboxHooks {
    store: Arc<PaymentStore>,
}

impl OutboxHooks {
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StorefrontHooks for OutboxHooks {
    async fn on_balance_credit(
        &self,
        user_id: i64,
        fiat_amount: Decimal,
        reason: &str,
    ) -> PayResult<()> {
        self.store
            .insert_outbox(
                "balance_credit",
                Some(user_id),
                json!({ "amount": fiat_amount.to_string(), "reason": reason }),
            )
            .await
    }

    async fn on_purchase_delivery(
        &self,
        user_id: i64,
        line_items: &[LineItem],
        discount_ref: Option<&str>,
        order_id: &str,
    ) -> PayResult<()> {
        self.store
            .insert_outbox(
                "purchase_delivery",
                Some(user_id),
                json!({
                    "order_id": order_id,
                    "line_items": line_items,
                    "discount_ref": discount_ref,
                }),
            )
            .await
    }

    async fn on_notify_user(&self, user_id: i64, message: &str) -> PayResult<()> {
        self.store
            .insert_outbox("notify_user", Some(user_id), json!({ "message": message }))
            .await
    }

    async fn on_admin_alert(&self, message: &str) -> PayResult<()> {
        self.store
            .insert_outbox("admin_alert", None, json!({ "message": message }))
            .await
    }
}
