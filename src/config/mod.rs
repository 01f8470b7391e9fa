//! Configuration management for mediand
//!
//! Loads the normalized oracle config from defaults + optional file +
//! environment variables (MEDIAND_* via .env).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main oracle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Aggregation tick interval in milliseconds
    pub update_interval_ms: u64,
    /// Maximum quote age before it is treated as absent, in milliseconds
    pub max_price_age_ms: u64,
    /// Price and market-map providers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Enable metrics emission
    pub metrics_enabled: bool,
    /// Host the oracle read service binds to
    pub host: String,
    /// Port the oracle read service binds to
    pub port: u16,
    /// Path to read the initial market map from
    #[serde(default)]
    pub market_map_path: Option<String>,
    /// Path the latest accepted market map is written to (atomic replace)
    #[serde(default)]
    pub update_market_map_path: Option<String>,
    /// Deadline for a single price read, in milliseconds
    pub client_timeout_ms: u64,
}

/// Per-provider configuration. Exactly one of `api` / `websocket` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name, e.g. "binance_ws"
    pub name: String,
    /// Whether the orchestrator may run this provider
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// REST polling transport
    #[serde(default)]
    pub api: Option<ApiConfig>,
    /// WebSocket streaming transport
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,
    /// Marks the provider that sources live market-map updates
    #[serde(default)]
    pub market_map_provider: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base endpoint URL
    pub url: String,
    /// Polling interval in milliseconds
    pub interval_ms: u64,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// WebSocket endpoint URL
    pub url: String,
    /// Keep-alive ping interval in milliseconds. Must be strictly below the
    /// remote's idle timeout (e.g. 20s against a 30s remote).
    pub ping_interval_ms: u64,
    /// Upper bound on the reconnect backoff, in milliseconds
    pub reconnection_timeout_ms: u64,
    /// Connection handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

impl OracleConfig {
    /// Load configuration from defaults, `config/mediand.*` if present, and
    /// MEDIAND_* environment variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .set_default("update_interval_ms", 1_000)?
            .set_default("max_price_age_ms", 120_000)?
            .set_default("metrics_enabled", false)?
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("client_timeout_ms", 3_000)?
            .add_source(File::with_name("config/mediand").required(false))
            .add_source(Environment::with_prefix("MEDIAND").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let cfg: OracleConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration. Invalid configuration is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.update_interval_ms == 0 {
            bail!("update_interval_ms must be positive");
        }
        if self.max_price_age_ms == 0 {
            bail!("max_price_age_ms must be positive");
        }
        if self.client_timeout_ms == 0 {
            bail!("client_timeout_ms must be positive");
        }

        let mut seen = std::collections::BTreeSet::new();
        for provider in &self.providers {
            provider
                .validate()
                .with_context(|| format!("provider {:?}", provider.name))?;
            if !seen.insert(provider.name.clone()) {
                bail!("duplicate provider name {:?}", provider.name);
            }
        }

        if self
            .providers
            .iter()
            .filter(|p| p.market_map_provider)
            .count()
            > 1
        {
            bail!("at most one market-map provider may be configured");
        }

        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Maximum quote age as a signed duration for timestamp arithmetic.
    pub fn max_price_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_price_age_ms as i64)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// The config entry for the market-map source, if one is configured.
    pub fn market_map_provider(&self) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.market_map_provider)
    }

    /// All price provider entries (everything except the market-map source).
    pub fn price_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| !p.market_map_provider)
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("provider name cannot be empty");
        }

        match (&self.api, &self.websocket) {
            (Some(api), None) => api.validate(),
            (None, Some(ws)) => {
                if self.market_map_provider {
                    bail!("market-map provider must use the api transport");
                }
                ws.validate()
            }
            (Some(_), Some(_)) => bail!("provider cannot configure both api and websocket"),
            (None, None) => bail!("provider must configure either api or websocket"),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            bail!("api url cannot be empty");
        }
        if self.interval_ms == 0 {
            bail!("api interval_ms must be positive");
        }
        if self.timeout_ms == 0 {
            bail!("api timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WebSocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            bail!("websocket url cannot be empty");
        }
        if self.ping_interval_ms == 0 {
            bail!("websocket ping_interval_ms must be positive");
        }
        if self.reconnection_timeout_ms == 0 {
            bail!("websocket reconnection_timeout_ms must be positive");
        }
        if self.handshake_timeout_ms == 0 {
            bail!("websocket handshake_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconnection_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnection_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            interval_ms: 1_000,
            timeout_ms: 3_000,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            // 20s against the common 30s remote idle timeout
            ping_interval_ms: 20_000,
            reconnection_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}
