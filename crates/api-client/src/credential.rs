use core_types::Exchange;
use std::fmt;

/// Plaintext API credentials, alive only for the duration of a connect or sync.
///
/// Deliberately neither `Clone` nor serializable, and its `Debug` output never
/// includes the key material.
pub struct DecryptedCredential {
    exchange: Exchange,
    api_key: String,
    api_secret: String,
}

impl DecryptedCredential {
    pub fn new(
        exchange: Exchange,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Binance/Kraken API key, or the Coinbase key name.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// HMAC secret, or the Coinbase EC private key in PEM form.
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("exchange", &self.exchange)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secrets() {
        let credential = DecryptedCredential::new(Exchange::Binance, "my-key", "my-secret");
        let printed = format!("{credential:?}");
        assert!(!printed.contains("my-key"));
        assert!(!printed.contains("my-secret"));
        assert!(printed.contains("Binance"));
    }
}
