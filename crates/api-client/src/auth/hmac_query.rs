use super::{AuthenticatedRequest, RequestSigner, SigningContext, encode_params, join_url};
use crate::credential::DecryptedCredential;
use crate::error::SigningError;
use core_types::Exchange;
use hmac::{Hmac, Mac};
use sha2::Sha256;

// Create a type alias for the HMAC-SHA256 implementation.
type HmacSha256 = Hmac<Sha256>;

/// Binance's server-side tolerance for the request timestamp, in milliseconds.
const RECV_WINDOW_MS: &str = "5000";

/// Signs Binance requests: HMAC-SHA256 over the query string, hex-encoded into
/// a trailing `signature` parameter, with the API key in `X-MBX-APIKEY`.
#[derive(Debug, Clone)]
pub struct HmacQuerySigner {
    base_url: String,
}

impl HmacQuerySigner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

/// Creates an HMAC-SHA256 signature for a given query string.
///
/// Returns the lowercase hex digest Binance expects.
pub fn sign_query(secret: &str, query_string: &str) -> Result<String, SigningError> {
    // Create a new HMAC-SHA256 instance with the secret key.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError::MalformedSecret(e.to_string()))?;

    // Update the HMAC instance with the data to be signed (the query string).
    mac.update(query_string.as_bytes());

    // Convert the raw bytes into a hexadecimal string, which is what the API expects.
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl RequestSigner for HmacQuerySigner {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn sign(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<AuthenticatedRequest, SigningError> {
        if credential.api_key().trim().is_empty() {
            return Err(SigningError::MalformedKey("API key is empty".into()));
        }
        if credential.api_secret().is_empty() {
            return Err(SigningError::MalformedSecret("API secret is empty".into()));
        }
        if ctx.timestamp_ms() <= 0 {
            return Err(SigningError::Clock(format!(
                "timestamp {} is not a valid epoch",
                ctx.timestamp_ms()
            )));
        }

        // 1. Canonical query: caller params plus timestamp and recvWindow.
        let mut params = ctx.params().clone();
        params.insert("timestamp".into(), ctx.timestamp_ms().to_string());
        params
            .entry("recvWindow".into())
            .or_insert_with(|| RECV_WINDOW_MS.to_string());
        let query_string = encode_params(&params)?;

        // 2. Sign exactly the bytes that go on the wire.
        let signature = sign_query(credential.api_secret(), &query_string)?;

        let url = format!(
            "{}?{}&signature={}",
            join_url(&self.base_url, &ctx.path()),
            query_string,
            signature
        );

        Ok(AuthenticatedRequest {
            method: ctx.method(),
            url,
            headers: vec![("X-MBX-APIKEY".into(), credential.api_key().to_string())],
            body: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::{HttpMethod, ReadEndpoint};

    fn credential() -> DecryptedCredential {
        DecryptedCredential::new(
            Exchange::Binance,
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        )
    }

    #[test]
    fn matches_the_published_binance_example() {
        // Worked example from the Binance REST API documentation.
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(credential().api_secret(), query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signing_is_deterministic_for_fixed_inputs() {
        let signer = HmacQuerySigner::new("https://api.binance.com");
        let ctx = SigningContext::new(ReadEndpoint::BinanceMyTrades, 1_700_000_000_000)
            .with_param("symbol", "BTCUSDT");
        let a = signer.sign(&credential(), &ctx).unwrap();
        let b = signer.sign(&credential(), &ctx).unwrap();
        assert_eq!(a.url, b.url);
    }

    #[test]
    fn request_shape() {
        let signer = HmacQuerySigner::new("https://api.binance.com/");
        let ctx = SigningContext::new(ReadEndpoint::BinanceAccount, 1_700_000_000_000);
        let request = signer.sign(&credential(), &ctx).unwrap();

        assert_eq!(request.method, HttpMethod::Get);
        assert!(request.body.is_none());
        assert!(request.url.starts_with(
            "https://api.binance.com/api/v3/account?recvWindow=5000&timestamp=1700000000000&signature="
        ));
        assert_eq!(request.header("X-MBX-APIKEY"), Some(credential().api_key()));

        // The signature covers everything before `&signature=`.
        let (head, signature) = request.url.split_once("&signature=").unwrap();
        let query = head.split_once('?').unwrap().1;
        assert_eq!(
            sign_query(credential().api_secret(), query).unwrap(),
            signature
        );
    }

    #[test]
    fn different_params_change_the_signature() {
        let signer = HmacQuerySigner::new("https://api.binance.com");
        let base = SigningContext::new(ReadEndpoint::BinanceMyTrades, 1_700_000_000_000);
        let a = signer
            .sign(&credential(), &base.clone().with_param("symbol", "BTCUSDT"))
            .unwrap();
        let b = signer
            .sign(&credential(), &base.with_param("symbol", "ETHUSDT"))
            .unwrap();
        assert_ne!(
            a.url.split("&signature=").nth(1),
            b.url.split("&signature=").nth(1)
        );
    }

    #[test]
    fn empty_secret_is_a_signing_error() {
        let signer = HmacQuerySigner::new("https://api.binance.com");
        let credential = DecryptedCredential::new(Exchange::Binance, "key", "");
        let ctx = SigningContext::new(ReadEndpoint::BinanceAccount, 1);
        assert!(matches!(
            signer.sign(&credential, &ctx),
            Err(SigningError::MalformedSecret(_))
        ));
    }
}
