//! WebSocket streaming price provider
//!
//! Maintains a long-lived stream to an exchange through a `WsHandler` codec
//! seam. Keep-alive pings are sent strictly more often than the remote's idle
//! timeout, a silence watchdog forces reconnects, and reconnect attempts back
//! off exponentially with jitter up to the configured reconnection timeout.
//! Malformed messages are logged and dropped; they never fail the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::config::WebSocketConfig;
use crate::types::{CurrencyPair, ProviderKind, ProviderPairs, QuotePrice};

use super::{backoff_with_jitter, Provider, QuoteEvent};

const WATCHDOG_SILENCE_SECS: u64 = 30;
const WATCHDOG_TICK_SECS: u64 = 5;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// The per-exchange seam: subscription frames and message parsing. The
/// endpoint itself comes from the provider's `WebSocketConfig`.
pub trait WsHandler: Send + Sync + 'static {
    /// The text frames that subscribe the given pair set.
    fn subscribe_messages(&self, pairs: &ProviderPairs) -> Result<Vec<String>>;

    /// Parse one text frame into quotes. Heartbeats and other irrelevant
    /// frames return an empty vec; parse failures are dropped by the caller.
    fn parse_message(&self, text: &str) -> Result<Vec<(CurrencyPair, QuotePrice)>>;
}

/// Streaming provider generic over the exchange codec.
pub struct WebSocketProvider<H> {
    name: String,
    cfg: WebSocketConfig,
    handler: Arc<H>,
    quote_tx: mpsc::Sender<QuoteEvent>,
    pairs_tx: watch::Sender<ProviderPairs>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<H: WsHandler> WebSocketProvider<H> {
    pub fn new(
        name: impl Into<String>,
        cfg: WebSocketConfig,
        handler: H,
        pairs: ProviderPairs,
        quote_tx: mpsc::Sender<QuoteEvent>,
    ) -> Self {
        let (pairs_tx, _) = watch::channel(pairs);
        Self {
            name: name.into(),
            cfg,
            handler: Arc::new(handler),
            quote_tx,
            pairs_tx,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<H: WsHandler> Provider for WebSocketProvider<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::WebSocket
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
        let handle = tokio::spawn(run_stream_loop(
            self.name.clone(),
            self.cfg.clone(),
            Arc::clone(&self.handler),
            self.quote_tx.clone(),
            self.pairs_tx.subscribe(),
            shutdown_rx,
            Arc::clone(&self.running),
        ));

        self.running.store(true, Ordering::SeqCst);
        *task = Some((shutdown_tx, handle));
        info!(provider = %self.name, "Started websocket provider");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let Some((shutdown_tx, mut handle)) = task.take() else {
            return Ok(());
        };

        let _ = shutdown_tx.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(provider = %self.name, "Stream loop did not stop in time; aborting");
            handle.abort();
        }

        self.running.store(false, Ordering::SeqCst);
        info!(provider = %self.name, "Stopped websocket provider");
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

async fn run_stream_loop<H: WsHandler>(
    name: String,
    cfg: WebSocketConfig,
    handler: Arc<H>,
    quote_tx: mpsc::Sender<QuoteEvent>,
    mut pairs_rx: watch::Receiver<ProviderPairs>,
    mut shutdown_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) {
    let mut attempt = 0u32;

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pairs = pairs_rx.borrow_and_update().clone();
        if pairs.is_empty() {
            tokio::select! {
                _ = pairs_rx.changed() => continue 'reconnect,
                _ = shutdown_rx.changed() => break 'reconnect,
            }
        }

        info!(provider = %name, url = %cfg.url, attempt, "Connecting websocket");

        let connected = tokio::select! {
            res = tokio::time::timeout(cfg.handshake_timeout(), connect_async(cfg.url.as_str())) => res,
            _ = shutdown_rx.changed() => break 'reconnect,
        };
        let stream = match connected {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(provider = %name, error = %e, "Websocket connect failed");
                attempt = attempt.saturating_add(1);
                if !sleep_before_retry(&name, attempt, &cfg, &mut shutdown_rx).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }
            Err(_) => {
                warn!(provider = %name, "Websocket handshake timed out");
                attempt = attempt.saturating_add(1);
                if !sleep_before_retry(&name, attempt, &cfg, &mut shutdown_rx).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }
        };

        let (mut write, mut read) = stream.split();

        let subscriptions = match handler.subscribe_messages(&pairs) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(provider = %name, error = %e, "Failed to build subscriptions");
                attempt = attempt.saturating_add(1);
                if !sleep_before_retry(&name, attempt, &cfg, &mut shutdown_rx).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }
        };
        for msg in subscriptions {
            if let Err(e) = write.send(Message::Text(msg)).await {
                warn!(provider = %name, error = %e, "Failed to send subscription");
                attempt = attempt.saturating_add(1);
                if !sleep_before_retry(&name, attempt, &cfg, &mut shutdown_rx).await {
                    break 'reconnect;
                }
                continue 'reconnect;
            }
        }

        info!(provider = %name, pairs = pairs.len(), "Websocket connected");
        attempt = 0;

        let mut ping_interval = tokio::time::interval(cfg.ping_interval());
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog_interval =
            tokio::time::interval(Duration::from_secs(WATCHDOG_TICK_SECS));
        watchdog_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_useful_message = Instant::now();
        let reason: &'static str = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match handler.parse_message(&text) {
                                Ok(quotes) => {
                                    if !quotes.is_empty() {
                                        last_useful_message = Instant::now();
                                    }
                                    for (pair, quote) in quotes {
                                        if !pairs.contains_key(&pair) {
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
                                Err(e) => {
                                    warn!(provider = %name, error = %e, "Dropping malformed message");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_useful_message = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!(provider = %name, "Websocket closed by server");
                            break "remote_close";
                        }
                        Some(Err(e)) => {
                            warn!(provider = %name, error = %e, "Websocket stream error");
                            break "stream_error";
                        }
                        None => {
                            info!(provider = %name, "Websocket stream ended");
                            break "stream_ended";
                        }
                        _ => {}
                    }
                }

                _ = pairs_rx.changed() => {
                    // Resubscribe with the replaced set on a fresh connection.
                    break "pair_set_changed";
                }

                _ = ping_interval.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!(provider = %name, error = %e, "Keep-alive ping failed");
                        break "ping_send_failed";
                    }
                }

                _ = watchdog_interval.tick() => {
                    if last_useful_message.elapsed().as_secs() >= WATCHDOG_SILENCE_SECS {
                        warn!(
                            provider = %name,
                            silence_secs = WATCHDOG_SILENCE_SECS,
                            "Watchdog timeout; reconnecting"
                        );
                        let _ = write.send(Message::Close(None)).await;
                        break "watchdog_timeout";
                    }
                }

                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };

        if reason == "pair_set_changed" {
            info!(provider = %name, "Pair set changed; resubscribing");
            continue 'reconnect;
        }

        attempt = attempt.saturating_add(1);
        warn!(provider = %name, reason, attempt, "Websocket reconnect scheduled");
        if !sleep_before_retry(&name, attempt, &cfg, &mut shutdown_rx).await {
            break 'reconnect;
        }
    }

    running.store(false, Ordering::SeqCst);
}

/// Sleep out the backoff for `attempt`, returning false if shutdown fired.
async fn sleep_before_retry(
    name: &str,
    attempt: u32,
    cfg: &WebSocketConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let delay = backoff_with_jitter(attempt, cfg.reconnection_timeout());
    tracing::debug!(provider = %name, delay_ms = delay.as_millis() as u64, "Backing off");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.changed() => false,
    }
}
