use crate::error::ConfigError;
use core_types::Exchange;
use serde::Deserialize;
use std::time::Duration;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vault: VaultSettings,
    pub sync: SyncSettings,
    pub exchanges: ExchangeSettings,
    pub pricing: PricingSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Checks the cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        if sync.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "sync.max_concurrency must be at least 1".into(),
            ));
        }
        if sync.max_pairs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.max_pairs must be at least 1".into(),
            ));
        }
        if sync.max_retries > 10 {
            return Err(ConfigError::ValidationError(
                "sync.max_retries must be 10 or fewer".into(),
            ));
        }
        if sync.max_pages == 0 {
            return Err(ConfigError::ValidationError(
                "sync.max_pages must be at least 1".into(),
            ));
        }
        if sync.quote_assets.is_empty() {
            return Err(ConfigError::ValidationError(
                "sync.quote_assets must name at least one quote asset".into(),
            ));
        }
        if sync.sync_deadline() <= sync.request_timeout() {
            return Err(ConfigError::ValidationError(
                "sync.sync_deadline_secs must exceed sync.request_timeout_ms".into(),
            ));
        }
        if sync.backoff_initial_ms > sync.backoff_max_ms {
            return Err(ConfigError::ValidationError(
                "sync.backoff_initial_ms must not exceed sync.backoff_max_ms".into(),
            ));
        }
        for exchange in Exchange::ALL {
            let endpoint = self.exchanges.for_exchange(exchange);
            if endpoint.base_url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "exchanges.{exchange}.base_url must be set"
                )));
            }
            if endpoint.rate_limit.burst == 0 || endpoint.rate_limit.replenish_interval_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "exchanges.{exchange}.rate_limit needs a non-zero burst and interval"
                )));
            }
        }
        Ok(())
    }
}

/// Where the master key for the credential envelopes comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Name of the environment variable holding the base64-encoded 32-byte key.
    pub master_key_env: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            master_key_env: "VAULTSYNC_MASTER_KEY".to_string(),
        }
    }
}

impl VaultSettings {
    /// Reads the encoded master key from the environment.
    pub fn master_key_material(&self) -> Result<String, ConfigError> {
        std::env::var(&self.master_key_env)
            .map_err(|_| ConfigError::MissingMasterKey(self.master_key_env.clone()))
    }
}

/// Parameters for the fetch orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Upper bound on the assets fanned out to per-pair/per-account fetches,
    /// chosen by USD value.
    pub max_pairs: usize,
    /// Fetch items in flight per credential.
    pub max_concurrency: usize,
    pub request_timeout_ms: u64,
    /// Whole-run deadline. Items still pending when it passes fail for this run.
    pub sync_deadline_secs: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Page cap per paginated item.
    pub max_pages: u32,
    /// Quote currencies used to build per-pair symbols (e.g. `BTC` + `USDT`).
    pub quote_assets: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_pairs: 10,
            max_concurrency: 4,
            request_timeout_ms: 10_000,
            sync_deadline_secs: 120,
            max_retries: 3,
            backoff_initial_ms: 250,
            backoff_max_ms: 4_000,
            max_pages: 20,
            quote_assets: vec!["USDT".to_string()],
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_deadline(&self) -> Duration {
        Duration::from_secs(self.sync_deadline_secs)
    }
}

/// Token bucket sizing for one `(exchange, credential)` lane.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Bucket capacity in request-weight units.
    pub burst: u32,
    /// Time to replenish one unit.
    pub replenish_interval_ms: u64,
    /// Longest a call may wait for budget before it fails as rate limited.
    pub max_wait_ms: u64,
}

impl RateLimitSettings {
    pub fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Connection details for one exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeEndpoint {
    pub base_url: String,
    pub rate_limit: RateLimitSettings,
}

/// Per-exchange endpoints. Defaults follow each exchange's documented ceilings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub binance: ExchangeEndpoint,
    pub kraken: ExchangeEndpoint,
    pub coinbase: ExchangeEndpoint,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            // 1200 request weight per minute.
            binance: ExchangeEndpoint {
                base_url: "https://api.binance.com".to_string(),
                rate_limit: RateLimitSettings {
                    burst: 1200,
                    replenish_interval_ms: 50,
                    max_wait_ms: 30_000,
                },
            },
            // Starter tier: counter of 15, decaying by 0.33 per second.
            kraken: ExchangeEndpoint {
                base_url: "https://api.kraken.com".to_string(),
                rate_limit: RateLimitSettings {
                    burst: 15,
                    replenish_interval_ms: 3_000,
                    max_wait_ms: 30_000,
                },
            },
            // 30 private requests per second.
            coinbase: ExchangeEndpoint {
                base_url: "https://api.coinbase.com".to_string(),
                rate_limit: RateLimitSettings {
                    burst: 30,
                    replenish_interval_ms: 34,
                    max_wait_ms: 10_000,
                },
            },
        }
    }
}

impl ExchangeSettings {
    pub fn for_exchange(&self, exchange: Exchange) -> &ExchangeEndpoint {
        match exchange {
            Exchange::Binance => &self.binance,
            Exchange::Kraken => &self.kraken,
            Exchange::Coinbase => &self.coinbase,
        }
    }
}

/// Spot price source used for USD valuation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    pub base_url: String,
    pub cache_ttl_secs: u64,
    /// Assets priced at exactly one dollar without a lookup.
    pub stablecoins: Vec<String>,
    /// Quote asset used to form ticker symbols.
    pub quote_asset: String,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            cache_ttl_secs: 60,
            stablecoins: ["USD", "USDT", "USDC", "BUSD", "DAI", "FDUSD", "TUSD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quote_asset: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
    /// When set, logs are also written to a daily-rolling file here.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "vaultsync.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.sync.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn deadline_must_exceed_request_timeout() {
        let mut config = Config::default();
        config.sync.sync_deadline_secs = 5;
        config.sync.request_timeout_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_quote_assets_are_rejected() {
        let mut config = Config::default();
        config.sync.quote_assets.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            max_pairs = 3

            [exchanges.kraken]
            base_url = "http://localhost:9000"
            rate_limit = { burst = 5, replenish_interval_ms = 100, max_wait_ms = 1000 }
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.max_pairs, 3);
        assert_eq!(config.sync.max_concurrency, 4);
        assert_eq!(config.exchanges.kraken.base_url, "http://localhost:9000");
        assert_eq!(config.exchanges.kraken.rate_limit.burst, 5);
        assert_eq!(config.exchanges.binance.base_url, "https://api.binance.com");
        config.validate().unwrap();
    }

    #[test]
    fn lookup_by_exchange() {
        let settings = ExchangeSettings::default();
        assert!(settings.for_exchange(Exchange::Coinbase).base_url.contains("coinbase"));
    }
}
