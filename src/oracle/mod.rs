pub mod sources;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PayError, PayResult};
use crate::store::repository::PaymentStore;
use crate::store::RetryPolicy;
use sources::{default_sources, PriceSource, SourceError};

/// In-process cache TTL.
const MEM_TTL_SECS: i64 = 300;
/// Durable (settings-row) cache TTL; survives restarts.
const DURABLE_TTL_SECS: i64 = 600;
/// Oldest in-process value still served when every live source is down.
const STALE_MAX_AGE_SECS: i64 = 3600;
/// Background refresh cadence, below MEM_TTL so interactive callers rarely
/// hit a live source synchronously.
const REFRESH_INTERVAL_SECS: u64 = 240;

/// Restart-surviving price cache layer. The sqlx-backed implementation is a
/// `bot_settings` row; tests use an in-memory one.
#[async_trait]
pub trait DurablePriceCache: Send + Sync {
    async fn load(&self) -> Option<(Decimal, DateTime<Utc>)>;
    async fn save(&self, price: Decimal);
}

/// Durable cache in the shared settings table, one row per asset/fiat pair.
/// Load and save failures are soft: the caller falls through to the next
/// cache layer.
pub struct SettingsPriceCache {
    store: Arc<PaymentStore>,
    key: String,
    retry: RetryPolicy,
}

impl SettingsPriceCache {
    pub fn new(store: Arc<PaymentStore>, asset: &str, fiat: &str) -> Self {
        Self {
            store,
            key: format!("spot_price_cache:{}:{}", asset, fiat),
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl DurablePriceCache for SettingsPriceCache {
    async fn load(&self) -> Option<(Decimal, DateTime<Utc>)> {
        match self.store.get_setting(&self.key).await {
            Ok(Some((raw, updated_at))) => match Decimal::from_str(&raw) {
                Ok(price) if price > Decimal::ZERO => Some((price, updated_at)),
                Ok(price) => {
                    warn!("Durable price cache row is not positive: {}", price);
                    None
                }
                Err(_) => {
                    warn!("Durable price cache row is not a decimal: {}", raw);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Could not read durable price cache: {}", e);
                None
            }
        }
    }

    async fn save(&self, price: Decimal) {
        let value = price.to_string();
        let result = self
            .retry
            .run("durable price cache write", || {
                let store = self.store.clone();
                let key = self.key.clone();
                let value = value.clone();
                async move { store.put_setting(&key, &value).await }
            })
            .await;

        if let Err(e) = result {
            debug!("Could not persist price cache: {}", e);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemCache {
    price: Option<Decimal>,
    fetched_at: Option<DateTime<Utc>>,
    last_source: Option<usize>,
}

/// Multi-source spot-price oracle with layered caching.
///
/// Resolution order: in-process cache (5 min) -> durable cache (10 min) ->
/// live sources in rotated order -> stale in-process value (up to 1 h).
/// The rotation starts after the source that served the previous live
/// fetch, so no single provider gets hammered into rate limiting.
///
/// The in-process cache is a single tuple behind a lock held only for the
/// copy; a lost update just costs one extra live fetch.
pub struct PriceOracle {
    http: reqwest::Client,
    sources: Vec<Box<dyn PriceSource>>,
    durable: Arc<dyn DurablePriceCache>,
    mem: RwLock<MemCache>,
    asset: String,
    fiat: String,
}

impl PriceOracle {
    pub fn new(asset: &str, fiat: &str, durable: Arc<dyn DurablePriceCache>) -> Self {
        Self::with_sources(asset, fiat, default_sources(asset, fiat), durable)
    }

    pub fn with_sources(
        asset: &str,
        fiat: &str,
        sources: Vec<Box<dyn PriceSource>>,
        durable: Arc<dyn DurablePriceCache>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            sources,
            durable,
            mem: RwLock::new(MemCache::default()),
            asset: asset.to_string(),
            fiat: fiat.to_string(),
        }
    }

    /// Current spot price in fiat units per asset unit.
    pub async fn spot_price(&self) -> PayResult<Decimal> {
        let now = Utc::now();

        // Layer 1: in-process cache.
        {
            let mem = self.mem.read();
            if let (Some(price), Some(fetched_at)) = (mem.price, mem.fetched_at) {
                let age = now - fetched_at;
                if age < ChronoDuration::seconds(MEM_TTL_SECS) {
                    debug!(
                        "💰 Memory cached {} price: {} {} (age {}s)",
                        self.asset,
                        price,
                        self.fiat,
                        age.num_seconds()
                    );
                    return Ok(price);
                }
            }
        }

        // Layer 2: durable cache.
        if let Some((price, updated_at)) = self.durable.load().await {
            if now - updated_at < ChronoDuration::seconds(DURABLE_TTL_SECS) {
                info!(
                    "📊 Durable cached {} price: {} {} (age {}s)",
                    self.asset,
                    price,
                    self.fiat,
                    (now - updated_at).num_seconds()
                );
                let mut mem = self.mem.write();
                mem.price = Some(price);
                mem.fetched_at = Some(now);
                return Ok(price);
            }
        }

        // Layer 3: live sources, rotated.
        let start_idx = {
            let mem = self.mem.read();
            mem.last_source.map(|i| (i + 1) % self.sources.len()).unwrap_or(0)
        };

        for offset in 0..self.sources.len() {
            let idx = (start_idx + offset) % self.sources.len();
            let source = &self.sources[idx];

            match source.fetch(&self.http).await {
                // A non-positive quote is provider garbage; caching it would
                // poison both layers and break order quoting.
                Ok(price) if price <= Decimal::ZERO => {
                    warn!("⚠️ {} returned non-positive price {}, skipping", source.name(), price);
                }
                Ok(price) => {
                    info!("✅ {} {} price: {} {}", source.name(), self.asset, price, self.fiat);
                    {
                        let mut mem = self.mem.write();
                        mem.price = Some(price);
                        mem.fetched_at = Some(now);
                        mem.last_source = Some(idx);
                    }
                    self.durable.save(price).await;
                    return Ok(price);
                }
                Err(e @ (SourceError::RateLimited | SourceError::Timeout)) => {
                    warn!("⚠️ {}: {}", source.name(), e);
                }
                Err(e) => {
                    debug!("{}: {}", source.name(), e);
                }
            }
        }

        // Layer 4: stale in-process value, last resort.
        let mem = self.mem.read().clone();
        if let (Some(price), Some(fetched_at)) = (mem.price, mem.fetched_at) {
            let age = now - fetched_at;
            if age < ChronoDuration::seconds(STALE_MAX_AGE_SECS) {
                warn!(
                    "⚠️ All price sources failed, serving stale cache ({}s old): {} {}",
                    age.num_seconds(),
                    price,
                    self.fiat
                );
                return Ok(price);
            }
            error!("❌ Stale price cache too old ({}s), cannot use", age.num_seconds());
        }

        error!("❌ All {} price sources and caches exhausted", self.asset);
        Err(PayError::PriceUnavailable)
    }

    /// Drop the in-process TTL so the next `spot_price` call resolves past
    /// layer 1.
    pub fn invalidate(&self) {
        self.mem.write().fetched_at = None;
    }

    #[cfg(test)]
    fn set_memory(&self, price: Decimal, fetched_at: DateTime<Utc>) {
        let mut mem = self.mem.write();
        mem.price = Some(price);
        mem.fetched_at = Some(fetched_at);
    }

    /// Proactive refresh: invalidate and re-resolve. A failed refresh
    /// restores the previous timestamp so it cannot erase a still-valid
    /// cache entry.
    pub async fn force_refresh(&self) {
        debug!("🔄 Background price refresh triggered");

        let previous = self.mem.read().fetched_at;
        self.invalidate();

        match self.spot_price().await {
            Ok(price) => debug!("✅ Background refresh successful: {} {}", price, self.fiat),
            Err(_) => {
                warn!("⚠️ Background refresh failed, restoring previous cache age");
                let mut mem = self.mem.write();
                if mem.fetched_at.is_none() {
                    mem.fetched_at = previous;
                }
            }
        }
    }

    /// Spawn the periodic refresh task.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> JoinHandle<()> {
        let oracle = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(REFRESH_INTERVAL_SECS));
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                oracle.force_refresh().await;
            }
        })
    }
}
