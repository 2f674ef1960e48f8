use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chain::LedgerClient;
use crate::config::Config;
use crate::error::PayResult;
use crate::hooks::StorefrontHooks;
use crate::issuer::WalletIssuer;
use crate::oracle::{PriceOracle, SettingsPriceCache};
use crate::recovery::RecoveryMonitor;
use crate::reservation::ReservationLedger;
use crate::scanner::DepositScanner;
use crate::settlement::SettlementEngine;
use crate::store::models::{NewOrder, PaymentInstructions};
use crate::store::repository::PaymentStore;
use crate::sweep::FundSweeper;

/// Connect to the database and run migrations.
pub async fn initialize_store(config: &Config) -> PayResult<Arc<PaymentStore>> {
    let pool = crate::store::initialize_database(&config.database_url).await?;
    Ok(Arc::new(PaymentStore::new(pool)))
}

/// Wired-up payment core: the caller-facing operations plus the background
/// loops. The caller supplies the storefront hook implementation.
pub struct PaymentCore {
    config: Config,
    oracle: Arc<PriceOracle>,
    issuer: Arc<WalletIssuer>,
    settlement: Arc<SettlementEngine>,
    scanner: Arc<DepositScanner>,
    recovery: Arc<RecoveryMonitor>,
}

impl PaymentCore {
    pub fn new(
        config: Config,
        store: Arc<PaymentStore>,
        hooks: Arc<dyn StorefrontHooks>,
    ) -> PayResult<Self> {
        info!("Initializing payment core components ...");

        let chain = Arc::new(LedgerClient::new(&config.solana_rpc_url));

        let durable = Arc::new(SettingsPriceCache::new(
            store.clone(),
            &config.asset_code,
            &config.fiat_code,
        ));
        let oracle = Arc::new(PriceOracle::new(
            &config.asset_code,
            &config.fiat_code,
            durable,
        ));
        info!(
            "✅ Price oracle initialized for {}/{}",
            config.asset_code, config.fiat_code
        );

        let sweeper = match (config.enable_auto_sweep, config.operator_wallet.as_deref()) {
            (true, Some(operator)) => {
                let sweeper = Arc::new(FundSweeper::new(store.clone(), chain.clone(), operator)?);
                info!("✅ Auto-sweep enabled to operator wallet {}", operator);
                Some(sweeper)
            }
            (true, None) => {
                warn!("⚠️ OPERATOR_WALLET not set - auto-sweep disabled");
                None
            }
            (false, _) => {
                info!("Auto-sweep disabled by configuration");
                None
            }
        };

        let reservations = Arc::new(ReservationLedger::new(store.clone()));
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            oracle.clone(),
            reservations,
            hooks.clone(),
            sweeper.clone(),
        ));

        let issuer = Arc::new(WalletIssuer::new(
            store.clone(),
            oracle.clone(),
            &config.asset_code,
        ));

        let scanner = Arc::new(DepositScanner::new(
            store.clone(),
            chain.clone(),
            settlement.clone(),
            sweeper,
            config.scan_concurrency,
            config.underpay_tolerance,
            config.expiry_window_minutes,
        ));

        let recovery = Arc::new(RecoveryMonitor::new(
            store,
            chain,
            settlement.clone(),
            hooks,
            config.underpay_tolerance,
            config.expiry_window_minutes,
            config.recovery_grace_minutes,
        ));

        Ok(Self {
            config,
            oracle,
            issuer,
            settlement,
            scanner,
            recovery,
        })
    }

    /// Request a payment: snapshot the order, mint (or re-serve) its
    /// deposit wallet, and return the instructions to show the user.
    pub async fn create_order(&self, new_order: NewOrder) -> PayResult<PaymentInstructions> {
        self.issuer.issue(new_order).await
    }

    /// Explicit non-success termination with the same release semantics as
    /// expiry.
    pub async fn cancel_order(&self, order_id: &str) -> PayResult<()> {
        self.settlement.cancel_order(order_id).await
    }

    /// Start the background loops: proactive price refresh, the deposit
    /// scan, and the recovery/health pass.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            "🚀 Starting payment loops (scan every {}s, recovery every {}s)",
            self.config.scan_interval_secs, self.config.recovery_interval_secs
        );

        vec![
            self.oracle.spawn_refresh_task(),
            self.scanner.clone().spawn(self.config.scan_interval_secs),
            self.recovery.clone().spawn(self.config.recovery_interval_secs),
        ]
    }
}
