use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::{PayError, PayResult};

/// Runtime configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub solana_rpc_url: String,
    /// Destination for swept funds. Sweeping is disabled when unset.
    pub operator_wallet: Option<String>,
    pub enable_auto_sweep: bool,
    /// Fraction of the expected amount that still counts as paid (0.97 =
    /// 3% underpayment grace).
    pub underpay_tolerance: Decimal,
    pub expiry_window_minutes: i64,
    pub scan_interval_secs: u64,
    pub scan_concurrency: usize,
    pub recovery_interval_secs: u64,
    pub recovery_grace_minutes: i64,
    pub asset_code: String,
    pub fiat_code: String,
}

impl Config {
    pub fn from_env() -> PayResult<Self> {
        let underpay_tolerance = parse_env("UNDERPAY_TOLERANCE", dec!(0.97))?;
        if underpay_tolerance <= Decimal::ZERO || underpay_tolerance > Decimal::ONE {
            return Err(PayError::Config(format!(
                "UNDERPAY_TOLERANCE must be in (0, 1], got {}",
                underpay_tolerance
            )));
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/solpay".to_string()),
            solana_rpc_url: std::env::var("SOLANA_RPC_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            operator_wallet: std::env::var("OPERATOR_WALLET").ok(),
            enable_auto_sweep: parse_env("ENABLE_AUTO_SWEEP", true)?,
            underpay_tolerance,
            expiry_window_minutes: parse_env("EXPIRY_WINDOW_MINUTES", 20)?,
            scan_interval_secs: parse_env("SCAN_INTERVAL_SECS", 45)?,
            scan_concurrency: parse_env("SCAN_CONCURRENCY", 10)?,
            recovery_interval_secs: parse_env("RECOVERY_INTERVAL_SECS", 300)?,
            recovery_grace_minutes: parse_env("RECOVERY_GRACE_MINUTES", 10)?,
            asset_code: std::env::var("ASSET_CODE").unwrap_or_else(|_| "SOL".to_string()),
            fiat_code: std::env::var("FIAT_CODE").unwrap_or_else(|_| "EUR".to_string()),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> PayResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| PayError::Config(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.underpay_tolerance, dec!(0.97));
        assert_eq!(config.expiry_window_minutes, 20);
        assert_eq!(config.scan_concurrency, 10);
        assert!(config.enable_auto_sweep);
        assert_eq!(config.asset_code, "SOL");
        assert_eq!(config.fiat_code, "EUR");
    }
}
