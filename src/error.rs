use thiserror::Error;

/// Top-level error type for the payment core.
///
/// Transient per-wallet failures (`LedgerRpc`) are recovered by the next scan
/// cycle and never abort a whole pass. A settlement attempt that loses the
/// pending-status race is not an error at all: the transactional guard
/// absorbs it silently.
#[derive(Error, Debug)]
pub enum PayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("All price sources and caches exhausted")]
    PriceUnavailable,

    #[error("Ledger RPC error: {0}")]
    LedgerRpc(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for PayError {
    fn from(error: reqwest::Error) -> Self {
        PayError::Internal(format!("HTTP request error: {:?}", error))
    }
}

impl From<rust_decimal::Error> for PayError {
    fn from(error: rust_decimal::Error) -> Self {
        PayError::Internal(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<serde_json::Error> for PayError {
    fn from(error: serde_json::Error) -> Self {
        PayError::Internal(format!("JSON error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for PayError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        PayError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the payment core.
pub type PayResult<T> = Result<T, PayError>;
