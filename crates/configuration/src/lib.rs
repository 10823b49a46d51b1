use crate::error::ConfigError;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use settings::{
    Config, ExchangeEndpoint, ExchangeSettings, LoggingSettings, PricingSettings,
    RateLimitSettings, SyncSettings, VaultSettings,
};

/// Loads the application configuration.
///
/// Reads an optional `config.toml`, then layers environment variables with the
/// `VAULTSYNC` prefix on top (`VAULTSYNC__SYNC__MAX_CONCURRENCY=8`). Every
/// section has defaults, so a missing file is not an error. The result is
/// validated before it is returned.
pub fn load_config() -> Result<Config, ConfigError> {
    let builder = config::Config::builder()
        // Tells the builder to look for a file named `config.toml`
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(
            config::Environment::with_prefix("VAULTSYNC")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sync.quote_assets")
                .with_list_parse_key("pricing.stablecoins")
                .try_parsing(true),
        )
        .build()?;

    // Attempt to deserialize the entire configuration into our `Config` struct
    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    tracing::debug!(
        max_concurrency = config.sync.max_concurrency,
        max_pairs = config.sync.max_pairs,
        "Configuration loaded."
    );

    Ok(config)
}
