use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use tracing::{error, info, warn};

use crate::chain::{decode_keypair, parse_pubkey, LedgerClient};
use crate::store::models::{Wallet, WalletStatus};
use crate::store::repository::PaymentStore;

/// Balances below this are not worth moving.
const SWEEP_DUST_LAMPORTS: u64 = 5_000;

/// Flat fee reserve left behind to pay for the transfer itself.
const TRANSFER_FEE_LAMPORTS: u64 = 5_000;

/// Lamports to actually move, if any. Dust and fee-only balances are
/// skipped.
pub fn sweep_amount(balance: u64) -> Option<u64> {
    if balance < SWEEP_DUST_LAMPORTS {
        return None;
    }
    balance.checked_sub(TRANSFER_FEE_LAMPORTS).filter(|amount| *amount > 0)
}

/// Moves settled funds from an ephemeral deposit wallet to the operator
/// wallet, signing with the deposit wallet's own key. This is the only
/// consumer of the stored private key material.
///
/// Sweeping is always safe to retry: the balance is re-derived on every
/// attempt, and a failure leaves the wallet `paid`/`underpaid` so the next
/// scan's recovery sub-pass picks it up again.
pub struct FundSweeper {
    store: Arc<PaymentStore>,
    chain: Arc<LedgerClient>,
    operator: Pubkey,
}

impl FundSweeper {
    pub fn new(
        store: Arc<PaymentStore>,
        chain: Arc<LedgerClient>,
        operator_wallet: &str,
    ) -> crate::error::PayResult<Self> {
        Ok(Self {
            store,
            chain,
            operator: parse_pubkey(operator_wallet)?,
        })
    }

    pub async fn sweep(&self, wallet: &Wallet) {
        let pubkey = match parse_pubkey(&wallet.public_key) {
            Ok(pubkey) => pubkey,
            Err(e) => {
                error!("Cannot sweep wallet {}: {}", wallet.id, e);
                return;
            }
        };

        let balance = match self.chain.balance(&pubkey).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Balance fetch for sweep of {} failed: {}", wallet.public_key, e);
                return;
            }
        };

        let amount = match sweep_amount(balance) {
            Some(amount) => amount,
            None => {
                // Nothing worth moving. A settled wallet with only dust left
                // is considered fully swept, so the retry sub-pass stops
                // re-queueing it.
                if wallet.status.awaits_sweep() {
                    self.mark_swept(wallet).await;
                }
                return;
            }
        };

        let keypair = match decode_keypair(&wallet.private_key) {
            Ok(keypair) => keypair,
            Err(e) => {
                error!("Cannot load key material for wallet {}: {}", wallet.id, e);
                return;
            }
        };

        info!(
            "🧹 Sweeping {} lamports from {} to {}...",
            amount, wallet.public_key, self.operator
        );

        match self.chain.submit_transfer(&keypair, &self.operator, amount).await {
            Ok(signature) => {
                info!("✅ Swept funds from {}. Sig: {}", wallet.public_key, signature);
                self.mark_swept(wallet).await;
            }
            Err(e) => {
                // Status stays paid/underpaid; the recovery sub-pass retries.
                error!("❌ Failed to sweep wallet {}: {}", wallet.public_key, e);
            }
        }
    }

    async fn mark_swept(&self, wallet: &Wallet) {
        match self.store.mark_swept(wallet.id).await {
            Ok(true) => {}
            Ok(false) => info!("Wallet {} already marked swept", wallet.id),
            Err(e) => warn!("Could not mark wallet {} swept: {}", wallet.id, e),
        }
    }
}
