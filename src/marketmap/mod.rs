//! Market map: which providers supply which currency pairs
//!
//! The market map is the mutable source of truth the orchestrator reconciles
//! against. Markets may be added or removed while the oracle runs; a
//! malformed map is rejected wholesale and the previous map stays in force.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{CurrencyPair, ProviderPairs};

/// Metadata for a traded pair. The decimal scale applies to every quote for
/// the pair, on every provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub currency_pair: CurrencyPair,
    /// Fixed-point scale of quoted prices
    pub decimals: u32,
}

/// One provider's view of a market: the provider name and its local symbol
/// for the pair (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketProviderConfig {
    pub name: String,
    pub off_chain_ticker: String,
}

/// A single market: ticker metadata plus the providers that supply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: Ticker,
    pub providers: Vec<MarketProviderConfig>,
}

/// Mapping from canonical pair string to its market record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketMap {
    pub markets: BTreeMap<String, Market>,
}

impl MarketMap {
    /// Validate the whole map. Any failure rejects the map wholesale.
    pub fn validate(&self) -> Result<()> {
        for (key, market) in &self.markets {
            let pair: CurrencyPair = key
                .parse()
                .with_context(|| format!("market key {key:?} is not a currency pair"))?;
            if pair != market.ticker.currency_pair {
                bail!(
                    "market key {key:?} does not match ticker pair {}",
                    market.ticker.currency_pair
                );
            }

            if market.providers.is_empty() {
                bail!("market {key:?} has no providers");
            }

            let mut seen = BTreeSet::new();
            for provider in &market.providers {
                if provider.name.trim().is_empty() {
                    bail!("market {key:?} has a provider with an empty name");
                }
                if provider.off_chain_ticker.trim().is_empty() {
                    bail!(
                        "market {key:?} provider {:?} has an empty ticker",
                        provider.name
                    );
                }
                if !seen.insert(provider.name.as_str()) {
                    bail!(
                        "market {key:?} lists provider {:?} more than once",
                        provider.name
                    );
                }
            }
        }

        Ok(())
    }

    /// All provider names referenced anywhere in the map.
    pub fn provider_names(&self) -> BTreeSet<String> {
        self.markets
            .values()
            .flat_map(|m| m.providers.iter().map(|p| p.name.clone()))
            .collect()
    }

    /// The pair -> provider-local ticker subset a given provider is
    /// responsible for.
    pub fn provider_pairs(&self, provider: &str) -> ProviderPairs {
        let mut pairs = ProviderPairs::new();
        for market in self.markets.values() {
            if let Some(cfg) = market.providers.iter().find(|p| p.name == provider) {
                pairs.insert(
                    market.ticker.currency_pair.clone(),
                    cfg.off_chain_ticker.clone(),
                );
            }
        }
        pairs
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read market map from {}", path.display()))?;
        let map: MarketMap = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse market map from {}", path.display()))?;
        map.validate()?;
        Ok(map)
    }

    /// Atomically replace the file at `path` with this map: write to a
    /// sibling temp file, then rename over the target.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).context("Failed to serialize market map")?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, raw)
            .with_context(|| format!("Failed to write market map to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move market map into {}", path.display()))?;

        Ok(())
    }
}
