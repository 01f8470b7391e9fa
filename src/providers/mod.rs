//! Price provider implementations
//!
//! A provider is one exchange adapter. Both variants (REST polling and
//! WebSocket streaming) emit `(pair, quote)` events into the orchestrator's
//! shared fan-in channel; the wire-level parsing is supplied per exchange
//! through the `PriceFetcher` / `WsHandler` seams.

pub mod api;
pub mod marketmap;
pub mod websocket;

pub use api::{ApiPriceProvider, PriceFetcher};
pub use marketmap::{HttpMarketMapSource, MarketMapSource};
pub use websocket::{WebSocketProvider, WsHandler};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CurrencyPair, ProviderKind, ProviderPairs, QuotePrice};

/// A quote emitted by a provider into the orchestrator's fan-in channel.
#[derive(Debug, Clone)]
pub struct QuoteEvent {
    pub provider: String,
    pub pair: CurrencyPair,
    pub quote: QuotePrice,
}

/// A running price provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Begin emission. Idempotent. Fails fast on unrecoverable configuration
    /// (e.g. an empty ticker set); transient transport errors are retried
    /// internally with bounded backoff.
    async fn start(&self) -> Result<()>;

    /// Terminate emission and release transport resources. Idempotent;
    /// returns within a bounded grace period even if the transport hangs.
    async fn stop(&self) -> Result<()>;

    /// Atomically replace the subscribed pair set. The next emitted quote
    /// reflects the new set.
    async fn update_pairs(&self, pairs: ProviderPairs) -> Result<()>;

    /// The pairs the provider is currently responsible for.
    fn pairs(&self) -> Vec<CurrencyPair>;

    fn is_running(&self) -> bool;
}

const BASE_BACKOFF_MS: u64 = 500;
const BACKOFF_JITTER_RATIO: f64 = 0.20;

/// Exponential backoff with +/-20% jitter, capped at `cap`.
pub(crate) fn backoff_with_jitter(attempt: u32, cap: Duration) -> Duration {
    let capped_attempt = attempt.min(16);
    let base = BASE_BACKOFF_MS.saturating_mul(1u64 << capped_attempt);
    let bounded = base.min(cap.as_millis() as u64).max(1);

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_micros() as f64;
    let unit = (micros % 1_000.0) / 1_000.0;
    let jitter = 1.0 + ((unit * 2.0) - 1.0) * BACKOFF_JITTER_RATIO;
    let millis = ((bounded as f64) * jitter)
        .round()
        .clamp(1.0, cap.as_millis() as f64) as u64;

    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        let cap = Duration::from_secs(10);
        let first = backoff_with_jitter(1, cap);
        let later = backoff_with_jitter(30, cap);
        assert!(first >= Duration::from_millis(1));
        assert!(first <= cap);
        assert!(later >= Duration::from_millis(1));
        assert!(later <= cap);
    }

    #[test]
    fn backoff_grows_until_the_cap() {
        let cap = Duration::from_secs(60);
        let early = backoff_with_jitter(1, cap);
        let late = backoff_with_jitter(10, cap);
        assert!(late > early);
    }
}
