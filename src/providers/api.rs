//! REST-polling price provider
//!
//! Polls an exchange REST API on a fixed interval through a `PriceFetcher`
//! seam. Fetch failures are transient: they are logged, backed off, and never
//! fail the provider.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::types::{CurrencyPair, ProviderKind, ProviderPairs, QuotePrice};

use super::{backoff_with_jitter, Provider, QuoteEvent};

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The per-exchange seam: given the provider-local tickers for a pair set,
/// return the freshly observed quotes.
#[async_trait]
pub trait PriceFetcher: Send + Sync + 'static {
    async fn fetch(&self, pairs: &ProviderPairs) -> Result<Vec<(CurrencyPair, QuotePrice)>>;
}

/// REST-polling provider generic over the exchange fetcher.
pub struct ApiPriceProvider<F> {
    name: String,
    cfg: ApiConfig,
    fetcher: Arc<F>,
    quote_tx: mpsc::Sender<QuoteEvent>,
    pairs_tx: watch::Sender<ProviderPairs>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<F: PriceFetcher> ApiPriceProvider<F> {
    pub fn new(
        name: impl Into<String>,
        cfg: ApiConfig,
        fetcher: F,
        pairs: ProviderPairs,
        quote_tx: mpsc::Sender<QuoteEvent>,
    ) -> Self {
        let (pairs_tx, _) = watch::channel(pairs);
        Self {
            name: name.into(),
            cfg,
            fetcher: Arc::new(fetcher),
            quote_tx,
            pairs_tx,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<F: PriceFetcher> Provider for ApiPriceProvider<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Api
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        if self.pairs_tx.borrow().is_empty() {
            bail!("no tickers configured for provider {}", self.name);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_poll_loop(
            self.name.clone(),
            self.cfg.clone(),
            Arc::clone(&self.fetcher),
            self.quote_tx.clone(),
            self.pairs_tx.subscribe(),
            shutdown_rx,
            Arc::clone(&self.running),
        ));

        self.running.store(true, Ordering::SeqCst);
        *task = Some((shutdown_tx, handle));
        info!(provider = %self.name, "Started api provider");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let Some((shutdown_tx, mut handle)) = task.take() else {
            return Ok(());
        };

        let _ = shutdown_tx.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(provider = %self.name, "Poll loop did not stop in time; aborting");
            handle.abort();
        }

        self.running.store(false, Ordering::SeqCst);
        info!(provider = %self.name, "Stopped api provider");
        Ok(())
    }

    async fn update_pairs(&self, pairs: ProviderPairs) -> Result<()> {
        self.pairs_tx.send_replace(pairs);
        Ok(())
    }

    fn pairs(&self) -> Vec<CurrencyPair> {
        self.pairs_tx.borrow().keys().cloned().collect()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_poll_loop<F: PriceFetcher>(
    name: String,
    cfg: ApiConfig,
    fetcher: Arc<F>,
    quote_tx: mpsc::Sender<QuoteEvent>,
    pairs_rx: watch::Receiver<ProviderPairs>,
    mut shutdown_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(cfg.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pairs = pairs_rx.borrow().clone();
                if pairs.is_empty() {
                    continue;
                }

                match tokio::time::timeout(cfg.timeout(), fetcher.fetch(&pairs)).await {
                    Ok(Ok(quotes)) => {
                        failures = 0;
                        for (pair, quote) in quotes {
                            // The fetch may race a pair-set update; only emit
                            // quotes for the current set.
                            if !pairs_rx.borrow().contains_key(&pair) {
                                continue;
                            }
                            let event = QuoteEvent {
                                provider: name.clone(),
                                pair,
                                quote,
                            };
                            if quote_tx.send(event).await.is_err() {
                                running.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        let delay = backoff_with_jitter(failures, MAX_POLL_BACKOFF);
                        warn!(
                            provider = %name,
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Price fetch failed; backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    Err(_) => {
                        failures += 1;
                        let delay = backoff_with_jitter(failures, MAX_POLL_BACKOFF);
                        warn!(
                            provider = %name,
                            timeout_ms = cfg.timeout_ms,
                            failures,
                            "Price fetch timed out; backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    running.store(false, Ordering::SeqCst);
}
