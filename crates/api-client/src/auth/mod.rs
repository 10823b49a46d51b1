//! Request signing for the three exchange protocols.
//!
//! Each exchange authenticates requests in a materially different way:
//!
//! - [`HmacQuerySigner`]: HMAC-SHA256 over the canonical query string (Binance).
//! - [`HmacPathSigner`]: HMAC-SHA512 over the path and a SHA-256 digest of the
//!   nonce and body (Kraken).
//! - [`BearerSigner`]: a short-lived ES256 JWT bound to method, host and path
//!   (Coinbase).
//!
//! All three sit behind [`RequestSigner`] and are selected through [`Signer`]
//! by the credential's exchange tag, so the connectors never branch on the
//! protocol themselves.

use crate::credential::DecryptedCredential;
use crate::endpoints::{HttpMethod, ReadEndpoint};
use crate::error::SigningError;
use core_types::Exchange;
use std::collections::BTreeMap;
use std::fmt;

mod bearer;
mod hmac_path;
mod hmac_query;

pub use bearer::BearerSigner;
pub use hmac_path::HmacPathSigner;
pub use hmac_query::HmacQuerySigner;

/// Everything a signer needs for one request. Never persisted.
#[derive(Debug, Clone)]
pub struct SigningContext {
    endpoint: ReadEndpoint,
    params: BTreeMap<String, String>,
    timestamp_ms: i64,
    nonce: Option<u64>,
}

impl SigningContext {
    pub fn new(endpoint: ReadEndpoint, timestamp_ms: i64) -> Self {
        Self {
            endpoint,
            params: BTreeMap::new(),
            timestamp_ms,
            nonce: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in params {
            self.params.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn endpoint(&self) -> &ReadEndpoint {
        &self.endpoint
    }

    pub fn exchange(&self) -> Exchange {
        self.endpoint.exchange()
    }

    pub fn method(&self) -> HttpMethod {
        self.endpoint.method()
    }

    pub fn path(&self) -> String {
        self.endpoint.path()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }
}

/// A fully signed request, ready for the transport.
#[derive(Clone)]
pub struct AuthenticatedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl AuthenticatedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for AuthenticatedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The URL carries the Binance signature and the headers carry keys;
        // only the method and path are safe to print.
        let path = self.url.split('?').next().unwrap_or_default();
        f.debug_struct("AuthenticatedRequest")
            .field("method", &self.method)
            .field("url", &path)
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Turns a logical request into an exchange-authenticated one.
pub trait RequestSigner: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn sign(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<AuthenticatedRequest, SigningError>;
}

/// The signer for each exchange protocol.
#[derive(Debug, Clone)]
pub enum Signer {
    HmacQuery(HmacQuerySigner),
    HmacPath(HmacPathSigner),
    AsymmetricBearer(BearerSigner),
}

impl Signer {
    pub fn for_exchange(exchange: Exchange, base_url: &str) -> Self {
        match exchange {
            Exchange::Binance => Signer::HmacQuery(HmacQuerySigner::new(base_url)),
            Exchange::Kraken => Signer::HmacPath(HmacPathSigner::new(base_url)),
            Exchange::Coinbase => Signer::AsymmetricBearer(BearerSigner::new(base_url)),
        }
    }
}

impl RequestSigner for Signer {
    fn exchange(&self) -> Exchange {
        match self {
            Signer::HmacQuery(signer) => signer.exchange(),
            Signer::HmacPath(signer) => signer.exchange(),
            Signer::AsymmetricBearer(signer) => signer.exchange(),
        }
    }

    fn sign(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<AuthenticatedRequest, SigningError> {
        // 1. A credential is only ever signed by its own exchange's protocol.
        if credential.exchange() != self.exchange() || ctx.exchange() != self.exchange() {
            return Err(SigningError::ExchangeMismatch {
                signer: self.exchange().to_string(),
                request: ctx.exchange().to_string(),
            });
        }

        // 2. Delegate to the protocol implementation.
        match self {
            Signer::HmacQuery(signer) => signer.sign(credential, ctx),
            Signer::HmacPath(signer) => signer.sign(credential, ctx),
            Signer::AsymmetricBearer(signer) => signer.sign(credential, ctx),
        }
    }
}

/// Joins a base URL and a path without doubling the slash.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Encodes parameters in the canonical (key-sorted) form the exchanges sign.
pub(crate) fn encode_params(params: &BTreeMap<String, String>) -> Result<String, SigningError> {
    serde_qs::to_string(params).map_err(|e| SigningError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_is_selected_by_exchange() {
        assert!(matches!(
            Signer::for_exchange(Exchange::Binance, "https://api.binance.com"),
            Signer::HmacQuery(_)
        ));
        assert!(matches!(
            Signer::for_exchange(Exchange::Kraken, "https://api.kraken.com"),
            Signer::HmacPath(_)
        ));
        assert!(matches!(
            Signer::for_exchange(Exchange::Coinbase, "https://api.coinbase.com"),
            Signer::AsymmetricBearer(_)
        ));
    }

    #[test]
    fn cross_exchange_signing_is_refused() {
        let signer = Signer::for_exchange(Exchange::Binance, "https://api.binance.com");
        let credential = DecryptedCredential::new(Exchange::Kraken, "key", "c2VjcmV0");
        let ctx = SigningContext::new(ReadEndpoint::BinanceAccount, 1_700_000_000_000);
        assert!(matches!(
            signer.sign(&credential, &ctx),
            Err(SigningError::ExchangeMismatch { .. })
        ));

        let credential = DecryptedCredential::new(Exchange::Binance, "key", "secret");
        let ctx = SigningContext::new(ReadEndpoint::KrakenBalanceEx, 1_700_000_000_000);
        assert!(signer.sign(&credential, &ctx).is_err());
    }

    #[test]
    fn debug_hides_signature_and_headers() {
        let request = AuthenticatedRequest {
            method: HttpMethod::Get,
            url: "https://api.binance.com/api/v3/account?timestamp=1&signature=abcdef".into(),
            headers: vec![("X-MBX-APIKEY".into(), "very-secret-key".into())],
            body: None,
        };
        let printed = format!("{request:?}");
        assert!(!printed.contains("abcdef"));
        assert!(!printed.contains("very-secret-key"));
        assert!(printed.contains("/api/v3/account"));
        assert_eq!(request.header("x-mbx-apikey"), Some("very-secret-key"));
    }

    #[test]
    fn params_encode_sorted() {
        let ctx = SigningContext::new(ReadEndpoint::BinanceMyTrades, 0)
            .with_param("symbol", "BTCUSDT")
            .with_params([("limit", "1000"), ("fromId", "5")]);
        assert_eq!(
            encode_params(ctx.params()).unwrap(),
            "fromId=5&limit=1000&symbol=BTCUSDT"
        );
    }

    #[test]
    fn url_join_handles_trailing_slash() {
        assert_eq!(join_url("https://x.com/", "/a"), "https://x.com/a");
        assert_eq!(join_url("https://x.com", "/a"), "https://x.com/a");
    }
}
