use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chain::{parse_pubkey, LedgerClient};
use crate::error::PayResult;
use crate::settlement::SettlementEngine;
use crate::store::models::{lamports_to_sol, Wallet, WalletStatus};
use crate::store::repository::PaymentStore;
use crate::sweep::FundSweeper;

/// What one balance check concluded about a pending wallet. Ephemeral;
/// consumed by the settlement engine, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Paid { observed: Decimal },
    Underpaid { observed: Decimal },
    Expired,
    NoActivity,
}

/// Classify an observed balance against the expected amount.
///
/// Funds at or above `expected * tolerance` count as paid; any other
/// nonzero balance is an underpayment regardless of age. An empty wallet
/// expires only once it outlives the expiry window.
pub fn classify(
    balance: Decimal,
    expected: Decimal,
    age: ChronoDuration,
    tolerance: Decimal,
    expiry_window: ChronoDuration,
) -> ScanOutcome {
    if balance > Decimal::ZERO && balance >= expected * tolerance {
        ScanOutcome::Paid { observed: balance }
    } else if balance > Decimal::ZERO {
        ScanOutcome::Underpaid { observed: balance }
    } else if age > expiry_window {
        ScanOutcome::Expired
    } else {
        ScanOutcome::NoActivity
    }
}

/// Periodic concurrent sweep of all pending deposit wallets.
///
/// Balance checks fan out under a counting semaphore so the RPC endpoint is
/// never hit by more than `scan_concurrency` requests at once; the results
/// are then drained into the settlement engine one at a time, which is what
/// makes the subsequent state transitions race-free without per-wallet
/// locks.
pub struct DepositScanner {
    store: Arc<PaymentStore>,
    chain: Arc<LedgerClient>,
    settlement: Arc<SettlementEngine>,
    sweeper: Option<Arc<FundSweeper>>,
    semaphore: Arc<Semaphore>,
    tolerance: Decimal,
    expiry_window: ChronoDuration,
}

impl DepositScanner {
    pub fn new(
        store: Arc<PaymentStore>,
        chain: Arc<LedgerClient>,
        settlement: Arc<SettlementEngine>,
        sweeper: Option<Arc<FundSweeper>>,
        concurrency: usize,
        tolerance: Decimal,
        expiry_window_minutes: i64,
    ) -> Self {
        Self {
            store,
            chain,
            settlement,
            sweeper,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            tolerance,
            expiry_window: ChronoDuration::minutes(expiry_window_minutes),
        }
    }

    /// One full scan pass over every pending wallet.
    pub async fn scan_once(&self) -> PayResult<()> {
        let pending = self.store.wallets_with_status(WalletStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(());
        }

        info!("🔍 Checking {} pending wallets...", pending.len());

        let checks = pending.iter().map(|wallet| self.check_wallet(wallet));
        let results = join_all(checks).await;

        // Serial drain: settlement attempts are never concurrent within a
        // pass, in discovery order.
        for (wallet, outcome) in pending.iter().zip(results) {
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => continue,
            };
            if let Err(e) = self.settlement.settle(wallet, outcome).await {
                error!("Settlement failed for order {}: {}", wallet.order_id, e);
            }
        }

        // Recovery sub-pass: a crash or RPC failure between settlement and
        // "sweep funds" leaves a paid or underpaid wallet unswept; re-queue
        // those every cycle.
        if let Some(sweeper) = &self.sweeper {
            let unswept = self.store.wallets_awaiting_sweep().await?;
            for wallet in unswept {
                let sweeper = sweeper.clone();
                tokio::spawn(async move {
                    sweeper.sweep(&wallet).await;
                });
            }
        }

        Ok(())
    }

    /// Balance check for one wallet, bounded by the scan semaphore. RPC
    /// failure skips the wallet this cycle; it is retried next pass.
    async fn check_wallet(&self, wallet: &Wallet) -> Option<ScanOutcome> {
        let _permit = self.semaphore.acquire().await.ok()?;

        let pubkey = match parse_pubkey(&wallet.public_key) {
            Ok(pubkey) => pubkey,
            Err(e) => {
                error!("Wallet {} has an unparseable public key: {}", wallet.id, e);
                return None;
            }
        };

        let lamports = match self.chain.balance(&pubkey).await {
            Ok(lamports) => lamports,
            Err(e) => {
                warn!(
                    "RPC error checking wallet {}..., retrying next cycle: {}",
                    &wallet.public_key[..wallet.public_key.len().min(16)],
                    e
                );
                return None;
            }
        };

        let balance = lamports_to_sol(lamports);
        let age = Utc::now() - wallet.created_at;
        match classify(balance, wallet.expected_amount, age, self.tolerance, self.expiry_window) {
            ScanOutcome::NoActivity => None,
            outcome => Some(outcome),
        }
    }

    /// Run the scan loop on a fixed interval.
    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = self.scan_once().await {
                    error!("Deposit scan pass failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TOLERANCE: Decimal = dec!(0.97);

    fn window() -> ChronoDuration {
        ChronoDuration::minutes(20)
    }

    fn minutes(n: i64) -> ChronoDuration {
        ChronoDuration::minutes(n)
    }

    #[test]
    fn exact_amount_is_paid() {
        assert_eq!(
            classify(dec!(0.1), dec!(0.1), minutes(1), TOLERANCE, window()),
            ScanOutcome::Paid { observed: dec!(0.1) }
        );
    }

    #[test]
    fn tolerance_boundary_is_inclusive() {
        let expected = dec!(0.1);
        let at_tolerance = expected * TOLERANCE;
        assert_eq!(
            classify(at_tolerance, expected, minutes(1), TOLERANCE, window()),
            ScanOutcome::Paid { observed: at_tolerance }
        );

        let just_below = at_tolerance - dec!(0.00000001);
        assert_eq!(
            classify(just_below, expected, minutes(1), TOLERANCE, window()),
            ScanOutcome::Underpaid { observed: just_below }
        );
    }

    #[test]
    fn ninety_five_percent_is_underpaid() {
        assert_eq!(
            classify(dec!(0.095), dec!(0.1), minutes(1), TOLERANCE, window()),
            ScanOutcome::Underpaid { observed: dec!(0.095) }
        );
    }

    #[test]
    fn overpayment_is_still_paid() {
        assert_eq!(
            classify(dec!(0.11), dec!(0.1), minutes(1), TOLERANCE, window()),
            ScanOutcome::Paid { observed: dec!(0.11) }
        );
    }

    #[test]
    fn empty_wallet_expires_only_past_the_window() {
        assert_eq!(
            classify(dec!(0), dec!(0.1), window() - ChronoDuration::seconds(1), TOLERANCE, window()),
            ScanOutcome::NoActivity
        );
        assert_eq!(
            classify(dec!(0), dec!(0.1), window() + ChronoDuration::seconds(1), TOLERANCE, window()),
            ScanOutcome::Expired
        );
    }

    #[test]
    fn partial_funds_beat_expiry() {
        // A wallet with money in it is settled as underpaid even after the
        // expiry window, so the user's funds are never silently dropped.
        assert_eq!(
            classify(dec!(0.01), dec!(0.1), minutes(60), TOLERANCE, window()),
            ScanOutcome::Underpaid { observed: dec!(0.01) }
        );
    }
}
