//! Core types used throughout mediand
//!
//! Defines currency pairs, quotes, and the per-provider price maps that flow
//! from providers to the aggregator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// A normalized currency pair, e.g. `BTC/USD`.
///
/// Both symbols are upper-cased on construction and are never empty.
/// The canonical string form is `BASE/QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Result<Self> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if base.is_empty() || quote.is_empty() {
            bail!("currency pair symbols cannot be empty");
        }

        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((base, quote)) => Self::new(base, quote),
            None => bail!("currency pair must be formatted as BASE/QUOTE, got {s:?}"),
        }
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> String {
        pair.to_string()
    }
}

/// The most recent price observed for a pair on one provider.
///
/// The price is a scaled fixed-point integer; the scale is part of the pair's
/// ticker metadata in the market map. `price == None` means the provider has
/// not produced a usable value yet and the aggregator must skip the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotePrice {
    pub price: Option<U256>,
    pub timestamp: DateTime<Utc>,
}

impl QuotePrice {
    pub fn new(price: U256, timestamp: DateTime<Utc>) -> Self {
        Self {
            price: Some(price),
            timestamp,
        }
    }

    /// A placeholder quote carrying no price.
    pub fn nil(timestamp: DateTime<Utc>) -> Self {
        Self {
            price: None,
            timestamp,
        }
    }

    /// Whether the quote was observed within `max_age` of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.timestamp) <= max_age
    }
}

/// Latest quote per pair for a single provider.
pub type ProviderPrices = BTreeMap<CurrencyPair, QuotePrice>;

/// Provider name to that provider's latest quotes.
pub type AggregatedProviderPrices = BTreeMap<String, ProviderPrices>;

/// Currency pair to the provider-local ticker symbol for it.
pub type ProviderPairs = BTreeMap<CurrencyPair, String>;

/// Transport flavor of a price provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    Api,
    WebSocket,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Api => write!(f, "api"),
            ProviderKind::WebSocket => write!(f, "websocket"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_normalizes_case() {
        let pair = CurrencyPair::new("btc", "usd").expect("valid pair");
        assert_eq!(pair.base(), "BTC");
        assert_eq!(pair.quote(), "USD");
        assert_eq!(pair.to_string(), "BTC/USD");
    }

    #[test]
    fn pair_rejects_empty_symbols() {
        assert!(CurrencyPair::new("", "usd").is_err());
        assert!(CurrencyPair::new("btc", "  ").is_err());
    }

    #[test]
    fn pair_parses_canonical_string() {
        let pair: CurrencyPair = "eth/usd".parse().expect("valid pair string");
        assert_eq!(pair, CurrencyPair::new("ETH", "USD").expect("valid pair"));
        assert!("ethusd".parse::<CurrencyPair>().is_err());
    }

    #[test]
    fn pair_serde_roundtrip() {
        let pair = CurrencyPair::new("btc", "usd").expect("valid pair");
        let json = serde_json::to_string(&pair).expect("serialize");
        assert_eq!(json, "\"BTC/USD\"");
        let back: CurrencyPair = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, pair);
    }

    #[test]
    fn quote_freshness() {
        let now = Utc::now();
        let fresh = QuotePrice::new(U256::from(100u64), now - Duration::seconds(10));
        let stale = QuotePrice::new(U256::from(100u64), now - Duration::minutes(10));
        assert!(fresh.is_fresh(now, Duration::minutes(1)));
        assert!(!stale.is_fresh(now, Duration::minutes(1)));
    }
}
