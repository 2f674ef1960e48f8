use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::types::Json;
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

/// Decimal places used when quoting an asset amount. Must match the
/// precision the settlement tolerance comparison is made at.
pub const ASSET_SCALE: u32 = 5;

/// Decimal places for fiat credits.
pub const FIAT_SCALE: u32 = 2;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Deposit wallet lifecycle. `pending` is the only non-terminal state;
/// `paid`/`underpaid` become `swept` once funds have been moved out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "wallet_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Pending,
    Paid,
    Underpaid,
    Expired,
    Swept,
}

impl WalletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Pending => "pending",
            WalletStatus::Paid => "paid",
            WalletStatus::Underpaid => "underpaid",
            WalletStatus::Expired => "expired",
            WalletStatus::Swept => "swept",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WalletStatus::Pending)
    }

    /// Settled with funds that may still need moving to the operator
    /// wallet. Underpaid wallets hold partial funds and are swept too.
    pub fn awaits_sweep(&self) -> bool {
        matches!(self, WalletStatus::Paid | WalletStatus::Underpaid)
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Purchase,
    Refill,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Purchase => write!(f, "purchase"),
            OrderKind::Refill => write!(f, "refill"),
        }
    }
}

/// One reserved inventory unit in the basket snapshot. Immutable once the
/// order is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_ref: i64,
    pub unit_price: Decimal,
    pub category: String,
}

/// A payment intent. The row lives in `pending_orders` and is deleted on
/// terminal resolution; its absence is the signal that inventory holds have
/// been handled one way or another.
#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub order_id: String,
    pub user_id: i64,
    pub target_fiat_amount: Decimal,
    pub asset_code: String,
    pub expected_asset_amount: Decimal,
    pub kind: OrderKind,
    pub line_items: Option<Json<Vec<LineItem>>>,
    pub discount_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn line_items(&self) -> &[LineItem] {
        self.line_items.as_ref().map(|j| j.0.as_slice()).unwrap_or(&[])
    }
}

/// Single-use deposit wallet, 1:1 with an order. Retained indefinitely for
/// audit; only the sweep path ever touches the private key material.
#[derive(Debug, Clone, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub order_id: String,
    pub user_id: i64,
    pub public_key: String,
    pub private_key: String,
    pub expected_amount: Decimal,
    pub received_amount: Decimal,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the caller needs to show the user: where to pay and how much.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentInstructions {
    pub pay_address: String,
    pub pay_amount: Decimal,
    pub asset_code: String,
    pub exchange_rate: Decimal,
    pub order_id: String,
}

/// Request shape for `create_order`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub user_id: i64,
    pub target_fiat_amount: Decimal,
    pub kind: OrderKind,
    pub line_items: Option<Vec<LineItem>>,
    pub discount_ref: Option<String>,
}

/// Round a raw `fiat / price` quotient down to the quoted asset precision.
/// Deterministic round-down so the user is never asked for less than the
/// fiat target is worth.
pub fn compute_expected_amount(fiat_amount: Decimal, price: Decimal) -> Decimal {
    (fiat_amount / price).round_dp_with_strategy(ASSET_SCALE, RoundingStrategy::ToZero)
}

/// Quantize a fiat credit to cents, rounding down.
pub fn quantize_fiat(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(FIAT_SCALE, RoundingStrategy::ToZero)
}

pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from(lamports) / Decimal::from(LAMPORTS_PER_SOL)
}
