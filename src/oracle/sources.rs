use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// Per-source HTTP timeout. A slow provider is skipped, not waited on.
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum SourceError {
    RateLimited,
    Timeout,
    Status(u16),
    Malformed,
    Transport(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::RateLimited => write!(f, "rate limited (429)"),
            SourceError::Timeout => write!(f, "timeout"),
            SourceError::Status(code) => write!(f, "status {}", code),
            SourceError::Malformed => write!(f, "malformed response"),
            SourceError::Transport(e) => write!(f, "transport: {}", e),
        }
    }
}

/// One external spot-price provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, client: &reqwest::Client) -> Result<Decimal, SourceError>;
}

type Extractor = Box<dyn Fn(&serde_json::Value) -> Option<Decimal> + Send + Sync>;

/// Generic JSON-over-HTTP price source: GET a URL, pull one decimal out of
/// the response body.
pub struct HttpPriceSource {
    name: String,
    url: String,
    extract: Extractor,
}

impl HttpPriceSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, extract: Extractor) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            extract,
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Decimal, SourceError> {
        let response = client
            .get(&self.url)
            .timeout(SOURCE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body: serde_json::Value = response.json().await.map_err(|_| SourceError::Malformed)?;
        (self.extract)(&body)
            .filter(|price| *price > Decimal::ZERO)
            .ok_or(SourceError::Malformed)
    }
}

/// Decimal out of either a JSON string or a JSON number, without a lossy
/// float round trip.
pub fn json_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// The provider rotation for one asset/fiat pair. Order matters only as a
/// starting point; the oracle rotates through it round-robin.
pub fn default_sources(asset: &str, fiat: &str) -> Vec<Box<dyn PriceSource>> {
    let fiat_upper = fiat.to_uppercase();
    let fiat_lower = fiat.to_lowercase();
    let coingecko_id = match asset.to_uppercase().as_str() {
        "SOL" => "solana",
        other => return vec![unsupported_source(other)],
    };

    let cc_key = fiat_upper.clone();
    let cg_key = fiat_lower.clone();
    let cg_id = coingecko_id.to_string();

    vec![
        Box::new(HttpPriceSource::new(
            "Binance",
            format!(
                "https://api.binance.com/api/v3/ticker/price?symbol={}{}",
                asset.to_uppercase(),
                fiat_upper
            ),
            Box::new(|body| json_decimal(body.get("price")?)),
        )),
        Box::new(HttpPriceSource::new(
            "CryptoCompare",
            format!(
                "https://min-api.cryptocompare.com/data/price?fsym={}&tsyms={}",
                asset.to_uppercase(),
                fiat_upper
            ),
            Box::new(move |body| json_decimal(body.get(&cc_key)?)),
        )),
        Box::new(HttpPriceSource::new(
            "CoinGecko",
            format!(
                "https://api.coingecko.com/api/v3/simple/price?ids={}&vs_currencies={}",
                coingecko_id, fiat_lower
            ),
            Box::new(move |body| json_decimal(body.get(&cg_id)?.get(&cg_key)?)),
        )),
    ]
}

/// Placeholder for assets the rotation has no providers for; every fetch
/// fails so the oracle reports `PriceUnavailable` instead of quoting junk.
fn unsupported_source(asset: &str) -> Box<dyn PriceSource> {
    struct Unsupported(String);

    #[async_trait]
    impl PriceSource for Unsupported {
        fn name(&self) -> &str {
            &self.0
        }

        async fn fetch(&self, _client: &reqwest::Client) -> Result<Decimal, SourceError> {
            Err(SourceError::Malformed)
        }
    }

    Box::new(Unsupported(format!("unsupported asset {}", asset)))
}
