use crate::error::ApiError;
use crate::responses::BinanceTickerPrice;
use crate::transport::HttpTransport;
use async_trait::async_trait;
use configuration::PricingSettings;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Best-effort USD spot prices. `None` means "no price", never an error.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn spot_price_usd(&self, asset: &str) -> Option<Decimal>;
}

/// Prices assets from Binance's public ticker, quoting against a USD stablecoin.
///
/// Lookups, including misses, are cached for the configured TTL so a sync
/// of many credentials does not re-query the same asset.
pub struct BinanceTickerOracle {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    quote_asset: String,
    stablecoins: HashSet<String>,
    ttl: Duration,
    cache: DashMap<String, (Option<Decimal>, Instant)>,
}

impl BinanceTickerOracle {
    pub fn new(transport: Arc<dyn HttpTransport>, settings: &PricingSettings) -> Self {
        Self {
            transport,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            quote_asset: settings.quote_asset.to_ascii_uppercase(),
            stablecoins: settings
                .stablecoins
                .iter()
                .map(|s| s.to_ascii_uppercase())
                .collect(),
            ttl: Duration::from_secs(settings.cache_ttl_secs),
            cache: DashMap::new(),
        }
    }

    fn cached(&self, asset: &str) -> Option<Option<Decimal>> {
        self.cache.get(asset).and_then(|entry| {
            let (price, stored_at) = *entry;
            (stored_at.elapsed() < self.ttl).then_some(price)
        })
    }

    async fn lookup(&self, asset: &str) -> Result<Option<Decimal>, ApiError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}{}",
            self.base_url, asset, self.quote_asset
        );
        let response = self.transport.get_public(&url).await?;
        if !response.is_success() {
            // Unknown symbols answer 400; that is a miss, not a failure.
            return Ok(None);
        }
        let ticker: BinanceTickerPrice = serde_json::from_str(&response.body)
            .map_err(|e| ApiError::Deserialization(e.to_string()))?;
        Ok(Some(ticker.price).filter(|price| *price > Decimal::ZERO))
    }
}

#[async_trait]
impl PriceOracle for BinanceTickerOracle {
    async fn spot_price_usd(&self, asset: &str) -> Option<Decimal> {
        let asset = asset.trim().to_ascii_uppercase();
        if asset.is_empty() {
            return None;
        }
        if self.stablecoins.contains(&asset) {
            return Some(Decimal::ONE);
        }
        if let Some(price) = self.cached(&asset) {
            return price;
        }

        match self.lookup(&asset).await {
            Ok(price) => {
                self.cache.insert(asset, (price, Instant::now()));
                price
            }
            Err(e) => {
                // Transport failures are not cached so the next sync can retry.
                tracing::warn!(%asset, error = %e, "Spot price lookup failed.");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatedRequest;
    use crate::transport::RawResponse;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickerStub {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for TickerStub {
        async fn execute(&self, _request: AuthenticatedRequest) -> Result<RawResponse, ApiError> {
            Err(ApiError::InvalidData("signed requests are not expected".into()))
        }

        async fn get_public(&self, url: &str) -> Result<RawResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, body) = if url.ends_with("symbol=BTCUSDT") {
                (200, r#"{"symbol":"BTCUSDT","price":"64000.50"}"#)
            } else {
                (400, r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            };
            Ok(RawResponse {
                status,
                retry_after: None,
                body: body.to_string(),
            })
        }
    }

    fn oracle() -> (Arc<TickerStub>, BinanceTickerOracle) {
        let stub = Arc::new(TickerStub {
            calls: AtomicUsize::new(0),
        });
        let oracle = BinanceTickerOracle::new(stub.clone(), &PricingSettings::default());
        (stub, oracle)
    }

    #[tokio::test]
    async fn stablecoins_are_one_dollar_without_a_lookup() {
        let (stub, oracle) = oracle();
        assert_eq!(oracle.spot_price_usd("usdc").await, Some(Decimal::ONE));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prices_and_misses_are_cached() {
        let (stub, oracle) = oracle();
        assert_eq!(oracle.spot_price_usd("BTC").await, Some(dec!(64000.50)));
        assert_eq!(oracle.spot_price_usd("BTC").await, Some(dec!(64000.50)));
        assert_eq!(oracle.spot_price_usd("NOPE").await, None);
        assert_eq!(oracle.spot_price_usd("NOPE").await, None);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }
}
