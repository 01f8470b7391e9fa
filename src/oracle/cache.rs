//! Per-provider latest-quote cache

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::types::{CurrencyPair, ProviderPrices, QuotePrice};

/// Latest quote per pair for one provider.
///
/// A single writer (the quote-routing task, in the provider's emission order)
/// and many readers. Quotes older than the configured maximum age are treated
/// as absent on read and evicted lazily.
#[derive(Debug)]
pub struct PriceCache {
    provider: String,
    max_age: Duration,
    prices: Mutex<BTreeMap<CurrencyPair, QuotePrice>>,
}

impl PriceCache {
    pub fn new(provider: impl Into<String>, max_age: Duration) -> Self {
        Self {
            provider: provider.into(),
            max_age,
            prices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Overwrite the latest quote for a pair unconditionally.
    pub fn put(&self, pair: CurrencyPair, quote: QuotePrice) {
        let mut prices = self.prices.lock().expect("price cache lock poisoned");
        prices.insert(pair, quote);
    }

    /// Snapshot of all quotes fresh at `now`. Expired entries are dropped
    /// from the cache while the lock is held.
    pub fn get_all(&self, now: DateTime<Utc>) -> ProviderPrices {
        let mut prices = self.prices.lock().expect("price cache lock poisoned");
        prices.retain(|_, quote| quote.is_fresh(now, self.max_age));
        prices.clone()
    }

    pub fn len(&self) -> usize {
        self.prices.lock().expect("price cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provider name to its cache. Owned and mutated by the orchestrator; the
/// oracle engine holds a read reference.
pub type SharedPriceCaches = Arc<RwLock<BTreeMap<String, Arc<PriceCache>>>>;

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use super::*;

    fn pair(s: &str) -> CurrencyPair {
        s.parse().expect("valid pair")
    }

    #[test]
    fn put_overwrites() {
        let cache = PriceCache::new("provider1", Duration::minutes(1));
        let now = Utc::now();

        cache.put(pair("BTC/USD"), QuotePrice::new(U256::from(100u64), now));
        cache.put(pair("BTC/USD"), QuotePrice::new(U256::from(200u64), now));

        let prices = cache.get_all(now);
        assert_eq!(prices.len(), 1);
        assert_eq!(
            prices.get(&pair("BTC/USD")).and_then(|q| q.price),
            Some(U256::from(200u64))
        );
    }

    #[test]
    fn stale_quotes_are_absent_and_evicted() {
        let cache = PriceCache::new("provider1", Duration::minutes(1));
        let now = Utc::now();

        cache.put(
            pair("BTC/USD"),
            QuotePrice::new(U256::from(100u64), now - Duration::seconds(10)),
        );
        cache.put(
            pair("ETH/USD"),
            QuotePrice::new(U256::from(200u64), now - Duration::minutes(10)),
        );

        let prices = cache.get_all(now);
        assert_eq!(prices.len(), 1);
        assert!(prices.contains_key(&pair("BTC/USD")));

        // The stale entry was evicted, not just filtered.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn nil_quotes_are_returned_when_fresh() {
        let cache = PriceCache::new("provider1", Duration::minutes(1));
        let now = Utc::now();

        cache.put(pair("BTC/USD"), QuotePrice::nil(now));
        let prices = cache.get_all(now);
        assert_eq!(prices.get(&pair("BTC/USD")).map(|q| q.price), Some(None));
    }
}
