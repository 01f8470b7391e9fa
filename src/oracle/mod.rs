//! Oracle engine
//!
//! Drives periodic aggregation: every update interval it snapshots all price
//! caches, computes the median index prices, and publishes the result as an
//! immutable snapshot. Readers always observe a complete snapshot; a new one
//! is published by swapping the shared reference.

pub mod aggregator;
pub mod cache;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use primitive_types::U256;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::OracleConfig;
use crate::types::AggregatedProviderPrices;
use cache::SharedPriceCaches;

pub use aggregator::compute_index_prices;
pub use cache::PriceCache;

/// An immutable aggregation result: index price per pair plus the instant it
/// was computed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub prices: BTreeMap<crate::types::CurrencyPair, U256>,
    pub computed_at: DateTime<Utc>,
}

/// The periodic aggregation driver.
pub struct Oracle {
    update_interval: Duration,
    max_price_age: chrono::Duration,
    caches: SharedPriceCaches,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl Oracle {
    pub fn new(cfg: &OracleConfig, caches: SharedPriceCaches) -> Self {
        Self {
            update_interval: cfg.update_interval(),
            max_price_age: cfg.max_price_age(),
            caches,
            snapshot: RwLock::new(None),
        }
    }

    /// Run the aggregation ticker until `shutdown` fires. Each tick collects
    /// every cache's fresh quotes, aggregates, and publishes atomically.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.update_interval.as_millis() as u64,
            "Starting oracle aggregation loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
                _ = shutdown.changed() => {
                    info!("Stopping oracle aggregation loop");
                    break;
                }
            }
        }
    }

    /// Perform one aggregation pass at `now` and publish the result.
    pub fn tick(&self, now: DateTime<Utc>) {
        let caches: Vec<Arc<PriceCache>> = {
            let guard = self.caches.read().expect("price caches lock poisoned");
            guard.values().cloned().collect()
        };

        let mut provider_prices = AggregatedProviderPrices::new();
        for cache in caches {
            let prices = cache.get_all(now);
            if !prices.is_empty() {
                provider_prices.insert(cache.provider().to_string(), prices);
            }
        }

        let prices = compute_index_prices(&provider_prices, now, self.max_price_age);
        debug!(
            pairs = prices.len(),
            providers = provider_prices.len(),
            "Published index snapshot"
        );

        let snapshot = Arc::new(IndexSnapshot {
            prices,
            computed_at: now,
        });
        *self.snapshot.write().expect("snapshot lock poisoned") = Some(snapshot);
    }

    /// The most recent snapshot, if any aggregation has completed yet.
    pub fn latest_snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }
}
