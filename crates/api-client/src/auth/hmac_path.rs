use super::{AuthenticatedRequest, RequestSigner, SigningContext, encode_params, join_url};
use crate::credential::DecryptedCredential;
use crate::error::SigningError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use core_types::Exchange;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Signs Kraken private requests.
///
/// 1. `SHA256(nonce ‖ postData)`
/// 2. `HMAC-SHA512(path ‖ digest)` keyed with the base64-decoded secret
/// 3. base64 of the result goes in `API-Sign`, the key in `API-Key`
///
/// The nonce is supplied by the caller's lane; this signer never invents one.
#[derive(Debug, Clone)]
pub struct HmacPathSigner {
    base_url: String,
}

impl HmacPathSigner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

/// Computes the `API-Sign` value for one request.
pub fn sign_path(
    secret_b64: &str,
    path: &str,
    nonce: u64,
    post_data: &str,
) -> Result<String, SigningError> {
    let secret = BASE64
        .decode(secret_b64.trim())
        .map_err(|e| SigningError::MalformedSecret(format!("secret is not base64: {e}")))?;

    // Step 1: SHA256(nonce + post_data)
    let mut sha256 = Sha256::new();
    sha256.update(nonce.to_string().as_bytes());
    sha256.update(post_data.as_bytes());
    let digest = sha256.finalize();

    // Step 2: HMAC-SHA512(path + digest)
    let mut mac = HmacSha512::new_from_slice(&secret)
        .map_err(|e| SigningError::MalformedSecret(e.to_string()))?;
    mac.update(path.as_bytes());
    mac.update(&digest);

    // Step 3: Base64 encode
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

impl RequestSigner for HmacPathSigner {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    fn sign(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<AuthenticatedRequest, SigningError> {
        if credential.api_key().trim().is_empty() {
            return Err(SigningError::MalformedKey("API key is empty".into()));
        }
        let nonce = ctx.nonce().ok_or(SigningError::MissingNonce)?;

        let mut params = ctx.params().clone();
        params.insert("nonce".into(), nonce.to_string());
        let post_data = encode_params(&params)?;

        let path = ctx.path();
        let signature = sign_path(credential.api_secret(), &path, nonce, &post_data)?;

        Ok(AuthenticatedRequest {
            method: ctx.method(),
            url: join_url(&self.base_url, &path),
            headers: vec![
                ("API-Key".into(), credential.api_key().to_string()),
                ("API-Sign".into(), signature),
                (
                    "Content-Type".into(),
                    "application/x-www-form-urlencoded; charset=utf-8".into(),
                ),
            ],
            body: Some(post_data),
        })
    }
}
