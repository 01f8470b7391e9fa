//! Index price computation
//!
//! Collapses per-provider quotes into one index price per pair using a
//! deterministic median. Two aggregators fed the same input produce the same
//! output bit-for-bit: ordered maps in, total unsigned ordering on values,
//! integer arithmetic only.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use primitive_types::{U256, U512};

use crate::types::{AggregatedProviderPrices, CurrencyPair};

/// Compute the median index price for every pair with at least one usable
/// quote. A quote is usable when its value is non-nil and it was observed
/// within `max_age` of `now`. Pairs with no usable quotes are omitted.
pub fn compute_index_prices(
    provider_prices: &AggregatedProviderPrices,
    now: DateTime<Utc>,
    max_age: Duration,
) -> BTreeMap<CurrencyPair, U256> {
    let mut values_per_pair: BTreeMap<CurrencyPair, Vec<U256>> = BTreeMap::new();

    for prices in provider_prices.values() {
        for (pair, quote) in prices {
            let Some(price) = quote.price else { continue };
            if !quote.is_fresh(now, max_age) {
                continue;
            }
            values_per_pair.entry(pair.clone()).or_default().push(price);
        }
    }

    values_per_pair
        .into_iter()
        .filter_map(|(pair, mut values)| median(&mut values).map(|price| (pair, price)))
        .collect()
}

/// Median of a set of 256-bit values. For an even count the result is the
/// truncating mean of the two middle elements, accumulated in 512 bits so the
/// sum cannot overflow.
fn median(values: &mut Vec<U256>) -> Option<U256> {
    if values.is_empty() {
        return None;
    }

    values.sort_unstable();

    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        return Some(values[mid]);
    }

    let sum = U512::from(values[mid - 1]) + U512::from(values[mid]);
    let half = sum / 2;
    // The halved sum of two 256-bit values always fits back into 256 bits.
    Some(U256::try_from(half).unwrap_or(U256::MAX))
}

#[cfg(test)]
mod tests {
    use crate::types::{ProviderPrices, QuotePrice};

    use super::*;

    fn pair(s: &str) -> CurrencyPair {
        s.parse().expect("valid pair")
    }

    fn provider_prices(
        now: DateTime<Utc>,
        quotes: &[(&str, &str, Option<u64>)],
    ) -> AggregatedProviderPrices {
        let mut out = AggregatedProviderPrices::new();
        for (provider, pair_str, price) in quotes {
            let quote = match price {
                Some(v) => QuotePrice::new(U256::from(*v), now),
                None => QuotePrice::nil(now),
            };
            out.entry(provider.to_string())
                .or_insert_with(ProviderPrices::new)
                .insert(pair(pair_str), quote);
        }
        out
    }

    #[test]
    fn empty_input_yields_empty_snapshot() {
        let prices = compute_index_prices(
            &AggregatedProviderPrices::new(),
            Utc::now(),
            Duration::minutes(1),
        );
        assert!(prices.is_empty());
    }

    #[test]
    fn single_provider_single_pair() {
        let now = Utc::now();
        let input = provider_prices(now, &[("provider1", "BTC/USD", Some(100))]);
        let prices = compute_index_prices(&input, now, Duration::minutes(1));
        assert_eq!(prices.get(&pair("BTC/USD")), Some(&U256::from(100u64)));
    }

    #[test]
    fn even_count_takes_truncating_mean() {
        let now = Utc::now();
        let input = provider_prices(
            now,
            &[
                ("provider1", "BTC/USD", Some(100)),
                ("provider1", "ETH/USD", Some(200)),
                ("provider2", "BTC/USD", Some(200)),
                ("provider2", "ETH/USD", Some(300)),
            ],
        );
        let prices = compute_index_prices(&input, now, Duration::minutes(1));
        assert_eq!(prices.get(&pair("BTC/USD")), Some(&U256::from(150u64)));
        assert_eq!(prices.get(&pair("ETH/USD")), Some(&U256::from(250u64)));
    }

    #[test]
    fn odd_count_takes_middle_element() {
        let now = Utc::now();
        let input = provider_prices(
            now,
            &[
                ("provider1", "BTC/USD", Some(100)),
                ("provider2", "BTC/USD", Some(200)),
                ("provider3", "BTC/USD", Some(300)),
            ],
        );
        let prices = compute_index_prices(&input, now, Duration::minutes(1));
        assert_eq!(prices.get(&pair("BTC/USD")), Some(&U256::from(200u64)));
    }

    #[test]
    fn nil_quotes_are_ignored() {
        let now = Utc::now();
        let input = provider_prices(
            now,
            &[
                ("provider1", "BTC/USD", Some(100)),
                ("provider2", "BTC/USD", None),
                ("provider2", "USDT/USD", None),
            ],
        );
        let prices = compute_index_prices(&input, now, Duration::minutes(1));
        assert_eq!(prices.get(&pair("BTC/USD")), Some(&U256::from(100u64)));
        assert!(!prices.contains_key(&pair("USDT/USD")));
    }

    #[test]
    fn stale_quotes_are_ignored() {
        let now = Utc::now();
        let mut input = provider_prices(now, &[("provider1", "BTC/USD", Some(100))]);
        input
            .entry("provider2".to_string())
            .or_insert_with(ProviderPrices::new)
            .insert(
                pair("BTC/USD"),
                QuotePrice::new(U256::from(200u64), now - Duration::minutes(10)),
            );

        let prices = compute_index_prices(&input, now, Duration::minutes(1));
        assert_eq!(prices.get(&pair("BTC/USD")), Some(&U256::from(100u64)));
    }

    #[test]
    fn provider_order_does_not_matter() {
        let now = Utc::now();
        let forward = provider_prices(
            now,
            &[
                ("a", "BTC/USD", Some(100)),
                ("b", "BTC/USD", Some(300)),
                ("c", "BTC/USD", Some(200)),
            ],
        );
        let reversed = provider_prices(
            now,
            &[
                ("c", "BTC/USD", Some(200)),
                ("b", "BTC/USD", Some(300)),
                ("a", "BTC/USD", Some(100)),
            ],
        );

        let max_age = Duration::minutes(1);
        assert_eq!(
            compute_index_prices(&forward, now, max_age),
            compute_index_prices(&reversed, now, max_age)
        );
    }

    #[test]
    fn even_median_does_not_overflow_at_the_top_of_the_range() {
        let mut values = vec![U256::MAX, U256::MAX - U256::from(1u64)];
        let result = median(&mut values).expect("median of two values");
        // (MAX + MAX-1) / 2 truncates to MAX-1.
        assert_eq!(result, U256::MAX - U256::from(1u64));
    }

    #[test]
    fn median_tie_breaking_is_stable() {
        let mut values = vec![U256::from(5u64), U256::from(5u64), U256::from(5u64)];
        assert_eq!(median(&mut values), Some(U256::from(5u64)));
    }
}
