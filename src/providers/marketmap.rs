//! Market-map source
//!
//! The pluggable source of live market-map updates. The default
//! implementation polls an HTTP endpoint; the orchestrator reacts to each
//! emitted snapshot via reconciliation. Consecutive identical snapshots are
//! deduplicated so reconciliation only runs on real changes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::marketmap::MarketMap;

/// A source of market-map snapshots.
#[async_trait]
pub trait MarketMapSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<MarketMap>;
}

/// Default source: GETs the configured endpoint and parses the JSON map.
pub struct HttpMarketMapSource {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpMarketMapSource {
    pub fn new(name: impl Into<String>, cfg: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .context("Failed to create market-map HTTP client")?;

        Ok(Self {
            name: name.into(),
            url: cfg.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl MarketMapSource for HttpMarketMapSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<MarketMap> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to fetch market map")?;

        if !response.status().is_success() {
            anyhow::bail!("market-map endpoint returned {}", response.status());
        }

        let map: MarketMap = response
            .json()
            .await
            .context("Failed to parse market map response")?;
        Ok(map)
    }
}

/// Poll `source` every `interval` and forward changed snapshots to `tx`
/// until `shutdown` fires. Fetch failures are logged and retried on the next
/// tick; they never end the loop.
pub async fn run_market_map_poller<S: MarketMapSource>(
    source: S,
    interval: Duration,
    tx: mpsc::Sender<MarketMap>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<MarketMap> = None;

    info!(source = %source.name(), "Starting market-map poller");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match source.fetch().await {
                    Ok(map) => {
                        if last.as_ref() == Some(&map) {
                            continue;
                        }
                        info!(
                            source = %source.name(),
                            markets = map.markets.len(),
                            "Market map changed"
                        );
                        last = Some(map.clone());
                        if tx.send(map).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(source = %source.name(), error = %e, "Market-map fetch failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!(source = %source.name(), "Stopping market-map poller");
                break;
            }
        }
    }
}
