//! Crypto payment reconciliation core for a storefront bot.
//!
//! The bot hands this crate an order snapshot and a set of callbacks; the
//! core mints a single-use deposit wallet, watches the chain for funds, and
//! settles each order exactly once (paid, underpaid, or expired) despite
//! concurrent pollers, retried triggers, and process restarts.

pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod error;
pub mod hooks;
pub mod issuer;
pub mod oracle;
pub mod recovery;
pub mod reservation;
pub mod scanner;
pub mod settlement;
pub mod store;
pub mod sweep;

pub use bootstrap::{initialize_store, PaymentCore};
pub use config::Config;
pub use error::{PayError, PayResult};
pub use hooks::{OutboxHooks, StorefrontHooks};
pub use store::models::{
    LineItem, NewOrder, Order, OrderKind, PaymentInstructions, Wallet, WalletStatus,
};
