//! mediand daemon
//!
//! Wires the provider orchestrator, the aggregation engine, the market-map
//! poller, and the oracle read client together, and tears the whole stack
//! down on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use mediand::config::{OracleConfig, ProviderConfig};
use mediand::marketmap::MarketMap;
use mediand::oracle::Oracle;
use mediand::orchestrator::{Orchestrator, ProviderFactory};
use mediand::providers::marketmap::run_market_map_poller;
use mediand::providers::{HttpMarketMapSource, Provider, QuoteEvent};
use mediand::service::{OracleClient, OracleService};
use mediand::types::ProviderPairs;

const MARKET_MAP_CHANNEL_CAPACITY: usize = 8;

/// The deployment's exchange-adapter seam. The stock daemon ships only the
/// market-map source; embedders register their exchange codecs here before
/// configuring the matching providers.
struct AdapterFactory;

impl ProviderFactory for AdapterFactory {
    fn make(
        &self,
        cfg: &ProviderConfig,
        _pairs: ProviderPairs,
        _quote_tx: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn Provider>> {
        bail!(
            "no exchange adapter registered for provider {:?}; \
             register one on the daemon's ProviderFactory",
            cfg.name
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = OracleConfig::load().context("failed to load oracle config")?;
    info!(
        update_interval_ms = cfg.update_interval_ms,
        max_price_age_ms = cfg.max_price_age_ms,
        providers = cfg.providers.len(),
        metrics_enabled = cfg.metrics_enabled,
        "Loaded configuration"
    );

    let market_map = match &cfg.market_map_path {
        Some(path) => {
            let map = MarketMap::read_from_file(path)?;
            info!(path = %path, markets = map.markets.len(), "Loaded market map");
            map
        }
        None => MarketMap::default(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(
        Orchestrator::new(cfg.clone(), market_map, Arc::new(AdapterFactory))
            .context("failed to build orchestrator")?,
    );
    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;

    let oracle = Arc::new(Oracle::new(&cfg, orchestrator.price_caches()));
    let engine = tokio::spawn(Arc::clone(&oracle).run(shutdown_rx.clone()));

    let mut background = vec![engine];
    if let Some(mm_cfg) = cfg.market_map_provider() {
        let api = mm_cfg
            .api
            .as_ref()
            .context("market-map provider must configure an api transport")?;
        let source = HttpMarketMapSource::new(mm_cfg.name.clone(), api)?;

        let (map_tx, map_rx) = mpsc::channel(MARKET_MAP_CHANNEL_CAPACITY);
        background.push(tokio::spawn(run_market_map_poller(
            source,
            api.interval(),
            map_tx,
            shutdown_rx.clone(),
        )));

        let orch = Arc::clone(&orchestrator);
        let reconcile_shutdown = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            orch.run_reconciliation(map_rx, reconcile_shutdown).await;
        }));
    } else {
        warn!("No market-map provider configured; market map is static");
    }

    let client = OracleClient::new(cfg.client_timeout());
    client.start(Arc::clone(&oracle) as Arc<dyn OracleService>);
    info!(host = %cfg.host, port = cfg.port, "Oracle read service ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received interrupt; shutting down");

    let _ = shutdown_tx.send(true);
    client.stop();
    orchestrator.stop().await;
    for task in background {
        let _ = task.await;
    }

    info!("Shutdown complete");
    Ok(())
}
