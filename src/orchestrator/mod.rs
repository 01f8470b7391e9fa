//! Provider orchestrator
//!
//! Owns the provider registry and price caches, wires provider emissions into
//! the caches, and reconciles the registry against live market-map updates:
//! per-provider pair-set diffs, start/stop transitions, construction of newly
//! referenced providers, and removal of providers that dropped out of the
//! map. All transitions run on the reconciliation task, so concurrent readers
//! always observe a consistent view.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{OracleConfig, ProviderConfig};
use crate::marketmap::MarketMap;
use crate::oracle::cache::{PriceCache, SharedPriceCaches};
use crate::providers::{Provider, QuoteEvent};
use crate::types::ProviderPairs;

const QUOTE_CHANNEL_CAPACITY: usize = 4096;

/// Builds a provider from its config entry and initial pair set. Supplied by
/// the binary (real exchange adapters) or by tests (mocks).
pub trait ProviderFactory: Send + Sync {
    fn make(
        &self,
        cfg: &ProviderConfig,
        pairs: ProviderPairs,
        quote_tx: mpsc::Sender<QuoteEvent>,
    ) -> Result<Arc<dyn Provider>>;
}

/// Everything the orchestrator tracks about one provider.
#[derive(Clone)]
pub struct ProviderState {
    pub provider: Arc<dyn Provider>,
    pub cache: Arc<PriceCache>,
    pub pairs: ProviderPairs,
    pub enabled: bool,
}

pub struct Orchestrator {
    cfg: OracleConfig,
    factory: Arc<dyn ProviderFactory>,
    registry: RwLock<BTreeMap<String, ProviderState>>,
    caches: SharedPriceCaches,
    market_map: RwLock<MarketMap>,
    quote_tx: mpsc::Sender<QuoteEvent>,
    quote_rx: Mutex<Option<mpsc::Receiver<QuoteEvent>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    write_to: Option<PathBuf>,
}

impl Orchestrator {
    /// Build the registry from the current market map. Every provider the map
    /// references must have a config entry; construction failures are fatal
    /// here (bad startup configuration), unlike at reconciliation time.
    pub fn new(
        cfg: OracleConfig,
        market_map: MarketMap,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self> {
        market_map.validate().context("invalid initial market map")?;

        let (quote_tx, quote_rx) = mpsc::channel(QUOTE_CHANNEL_CAPACITY);
        let caches: SharedPriceCaches = Arc::new(std::sync::RwLock::new(BTreeMap::new()));
        let mut registry = BTreeMap::new();

        for name in market_map.provider_names() {
            let provider_cfg = cfg
                .price_providers()
                .find(|p| p.name == name)
                .with_context(|| format!("market map references unknown provider {name:?}"))?
                .clone();

            let pairs = market_map.provider_pairs(&name);
            let state = build_state(
                &provider_cfg,
                pairs,
                factory.as_ref(),
                quote_tx.clone(),
                cfg.max_price_age(),
            )?;

            caches
                .write()
                .expect("price caches lock poisoned")
                .insert(name.clone(), Arc::clone(&state.cache));
            registry.insert(name, state);
        }

        let write_to = cfg.update_market_map_path.clone().map(PathBuf::from);
        Ok(Self {
            cfg,
            factory,
            registry: RwLock::new(registry),
            caches,
            market_map: RwLock::new(market_map),
            quote_tx,
            quote_rx: Mutex::new(Some(quote_rx)),
            router: Mutex::new(None),
            write_to,
        })
    }

    /// Read reference to the price caches, for the oracle engine.
    pub fn price_caches(&self) -> SharedPriceCaches {
        Arc::clone(&self.caches)
    }

    pub async fn market_map(&self) -> MarketMap {
        self.market_map.read().await.clone()
    }

    /// Start the quote router and every enabled provider with a non-empty
    /// pair set. A provider failing to start is logged and left stopped; the
    /// orchestrator keeps going.
    pub async fn start(&self) -> Result<()> {
        let mut router = self.router.lock().await;
        if router.is_none() {
            let rx = self
                .quote_rx
                .lock()
                .await
                .take()
                .context("orchestrator already consumed its quote receiver")?;
            *router = Some(tokio::spawn(route_quotes(rx, Arc::clone(&self.caches))));
        }
        drop(router);

        let registry = self.registry.read().await;
        for (name, state) in registry.iter() {
            if !state.enabled || state.pairs.is_empty() {
                continue;
            }
            if let Err(e) = state.provider.start().await {
                error!(provider = %name, error = %e, "Failed to start provider");
            }
        }

        info!(providers = registry.len(), "Orchestrator started");
        Ok(())
    }

    /// React to market-map updates until `shutdown` fires. A malformed update
    /// is rejected wholesale; the previous map remains in force.
    pub async fn run_reconciliation(
        &self,
        mut updates: mpsc::Receiver<MarketMap>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(map) = update else { break };
                    if let Err(e) = self.reconcile(map).await {
                        warn!(error = %e, "Rejected market-map update");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Apply one market-map update to the registry.
    pub async fn reconcile(&self, new_map: MarketMap) -> Result<()> {
        new_map.validate()?;

        for name in new_map.provider_names() {
            if !self.cfg.price_providers().any(|p| p.name == name) {
                bail!("market map references unknown provider {name:?}");
            }
        }

        let mut registry = self.registry.write().await;

        // Existing providers: update, stop-and-remove, or (re)start.
        let current: Vec<String> = registry.keys().cloned().collect();
        for name in current {
            let new_pairs = new_map.provider_pairs(&name);

            if new_pairs.is_empty() {
                let state = registry.remove(&name).expect("provider state exists");
                let _ = state.provider.update_pairs(ProviderPairs::new()).await;
                if let Err(e) = state.provider.stop().await {
                    warn!(provider = %name, error = %e, "Failed to stop removed provider");
                }
                self.caches
                    .write()
                    .expect("price caches lock poisoned")
                    .remove(&name);
                info!(provider = %name, "Provider removed from market map");
                continue;
            }

            let state = registry.get_mut(&name).expect("provider state exists");
            if new_pairs != state.pairs {
                state
                    .provider
                    .update_pairs(new_pairs.clone())
                    .await
                    .with_context(|| format!("failed to update provider {name:?}"))?;
                info!(provider = %name, pairs = new_pairs.len(), "Provider pair set updated");
                state.pairs = new_pairs;
            }

            if state.enabled && !state.provider.is_running() {
                if let Err(e) = state.provider.start().await {
                    error!(provider = %name, error = %e, "Failed to start provider");
                }
            }
        }

        // Newly referenced providers: construct and start. A construction
        // failure here only skips the one provider.
        for name in new_map.provider_names() {
            if registry.contains_key(&name) {
                continue;
            }
            let provider_cfg = self
                .cfg
                .price_providers()
                .find(|p| p.name == name)
                .expect("provider config checked above")
                .clone();

            let pairs = new_map.provider_pairs(&name);
            let state = match build_state(
                &provider_cfg,
                pairs,
                self.factory.as_ref(),
                self.quote_tx.clone(),
                self.cfg.max_price_age(),
            ) {
                Ok(state) => state,
                Err(e) => {
                    error!(provider = %name, error = %e, "Failed to construct provider");
                    continue;
                }
            };

            if state.enabled {
                if let Err(e) = state.provider.start().await {
                    error!(provider = %name, error = %e, "Failed to start provider");
                }
            }

            self.caches
                .write()
                .expect("price caches lock poisoned")
                .insert(name.clone(), Arc::clone(&state.cache));
            registry.insert(name.clone(), state);
            info!(provider = %name, "Provider added from market map");
        }

        drop(registry);

        *self.market_map.write().await = new_map.clone();

        if let Some(path) = &self.write_to {
            if let Err(e) = new_map.write_to_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to write market map");
            }
        }

        Ok(())
    }

    /// Stop every provider and the quote router.
    pub async fn stop(&self) {
        let registry = self.registry.read().await;
        for (name, state) in registry.iter() {
            if let Err(e) = state.provider.stop().await {
                warn!(provider = %name, error = %e, "Failed to stop provider");
            }
        }
        drop(registry);

        if let Some(router) = self.router.lock().await.take() {
            router.abort();
        }

        info!("Orchestrator stopped");
    }

    /// Snapshot of per-provider (enabled, running, pairs) for inspection.
    pub async fn provider_states(&self) -> BTreeMap<String, ProviderState> {
        self.registry.read().await.clone()
    }
}

fn build_state(
    cfg: &ProviderConfig,
    pairs: ProviderPairs,
    factory: &dyn ProviderFactory,
    quote_tx: mpsc::Sender<QuoteEvent>,
    max_age: chrono::Duration,
) -> Result<ProviderState> {
    let provider = factory.make(cfg, pairs.clone(), quote_tx)?;
    let cache = Arc::new(PriceCache::new(cfg.name.clone(), max_age));
    Ok(ProviderState {
        provider,
        cache,
        pairs,
        enabled: cfg.enabled,
    })
}

/// Route provider emissions into the per-provider caches. Quotes for a
/// provider that was removed mid-flight are dropped.
async fn route_quotes(mut rx: mpsc::Receiver<QuoteEvent>, caches: SharedPriceCaches) {
    while let Some(event) = rx.recv().await {
        let cache = {
            let guard = caches.read().expect("price caches lock poisoned");
            guard.get(&event.provider).cloned()
        };
        if let Some(cache) = cache {
            cache.put(event.pair, event.quote);
        }
    }
}
