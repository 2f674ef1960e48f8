use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::chain::{parse_pubkey, LedgerClient};
use crate::error::PayResult;
use crate::hooks::StorefrontHooks;
use crate::scanner::{classify, ScanOutcome};
use crate::settlement::SettlementEngine;
use crate::store::models::{lamports_to_sol, OrderKind, WalletStatus};
use crate::store::repository::{PaymentStorage, PaymentStore};

/// Advisory alert fires when the number of stuck orders outgrows recent
/// volume; an absolute floor keeps a quiet shop from alerting on noise.
pub fn should_alert(stuck: i64, recent: i64) -> bool {
    stuck > recent.max(5)
}

/// What the recovery pass does with a stale order, based on where its
/// wallet got stuck.
#[derive(Debug, PartialEq, Eq)]
enum RedriveAction {
    /// Still pending: re-check the balance and re-drive settlement.
    CheckBalance,
    /// Paid or already swept: delivery is mid-flight or failed loudly; not
    /// ours to re-trigger.
    Skip,
    /// Terminal without success, but the order row survived a crash before
    /// termination finished; release holds and drop the row.
    Terminate,
}

fn redrive_action(status: WalletStatus) -> RedriveAction {
    match status {
        WalletStatus::Pending => RedriveAction::CheckBalance,
        WalletStatus::Paid | WalletStatus::Swept => RedriveAction::Skip,
        WalletStatus::Underpaid | WalletStatus::Expired => RedriveAction::Terminate,
    }
}

/// Background reconciliation: re-drives settlement for orders that should
/// have settled but did not (a crash between detection and settlement, a
/// missed scan cycle), and keeps advisory health metrics.
///
/// Re-driving is safe because settlement is guarded by the pending-status
/// compare-and-set; a wallet that was in fact handled is a silent no-op.
pub struct RecoveryMonitor {
    store: Arc<PaymentStore>,
    chain: Arc<LedgerClient>,
    settlement: Arc<SettlementEngine>,
    hooks: Arc<dyn StorefrontHooks>,
    tolerance: Decimal,
    expiry_window: ChronoDuration,
    grace: ChronoDuration,
}

impl RecoveryMonitor {
    pub fn new(
        store: Arc<PaymentStore>,
        chain: Arc<LedgerClient>,
        settlement: Arc<SettlementEngine>,
        hooks: Arc<dyn StorefrontHooks>,
        tolerance: Decimal,
        expiry_window_minutes: i64,
        grace_minutes: i64,
    ) -> Self {
        Self {
            store,
            chain,
            settlement,
            hooks,
            tolerance,
            expiry_window: ChronoDuration::minutes(expiry_window_minutes),
            grace: ChronoDuration::minutes(grace_minutes),
        }
    }

    pub async fn run_once(&self) -> PayResult<()> {
        self.redrive_stale_orders().await?;
        self.health_check().await
    }

    /// Purchase orders past the grace period whose wallet never reached
    /// paid/swept are settlement attempts that may have crashed mid-flight.
    async fn redrive_stale_orders(&self) -> PayResult<()> {
        let cutoff = Utc::now() - self.grace;
        let stale = self.store.orders_older_than(cutoff).await?;

        for order in stale {
            if order.kind != OrderKind::Purchase {
                continue;
            }

            let wallet = match self.store.find_wallet_by_order(&order.order_id).await? {
                Some(wallet) => wallet,
                None => {
                    warn!(
                        "Order {} has no deposit wallet; wallet issuance never completed",
                        order.order_id
                    );
                    continue;
                }
            };

            match redrive_action(wallet.status) {
                RedriveAction::Skip => continue,
                RedriveAction::Terminate => {
                    info!(
                        "🔁 Wallet for order {} is {}, but the order row survived; terminating",
                        order.order_id, wallet.status
                    );
                    if let Err(e) = self.settlement.terminate_order(&order.order_id).await {
                        error!("Could not terminate stale order {}: {}", order.order_id, e);
                    }
                    continue;
                }
                RedriveAction::CheckBalance => {}
            }

            info!("🔁 Re-driving settlement for stale order {}", order.order_id);

            let pubkey = match parse_pubkey(&wallet.public_key) {
                Ok(pubkey) => pubkey,
                Err(e) => {
                    error!("Stale order {} wallet key unparseable: {}", order.order_id, e);
                    continue;
                }
            };

            let lamports = match self.chain.balance(&pubkey).await {
                Ok(lamports) => lamports,
                Err(e) => {
                    warn!("Recovery balance check failed for {}: {}", order.order_id, e);
                    continue;
                }
            };

            let outcome = classify(
                lamports_to_sol(lamports),
                wallet.expected_amount,
                Utc::now() - wallet.created_at,
                self.tolerance,
                self.expiry_window,
            );

            if outcome == ScanOutcome::NoActivity {
                continue;
            }

            if let Err(e) = self.settlement.settle(&wallet, outcome).await {
                error!("Recovery settlement failed for {}: {}", order.order_id, e);
            }
        }

        Ok(())
    }

    /// Advisory only: a high stuck-pending count relative to recent volume
    /// means the pipeline is wedged, not that this monitor can fix it.
    async fn health_check(&self) -> PayResult<()> {
        let now = Utc::now();
        let stuck = self.store.count_stuck_pending(now - self.expiry_window).await?;
        let recent = self.store.count_orders_created_since(now - ChronoDuration::hours(1)).await?;

        if should_alert(stuck, recent) {
            let message = format!(
                "Payment health: {} wallets stuck pending past the expiry window ({} orders created in the last hour)",
                stuck, recent
            );
            warn!("🚨 {}", message);
            if let Err(e) = self.hooks.on_admin_alert(&message).await {
                error!("Could not raise admin alert: {}", e);
            }
        }

        Ok(())
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("Recovery pass failed: {}", e);
                }
            }
        })
    }
}
