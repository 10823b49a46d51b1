use super::{AuthenticatedRequest, RequestSigner, SigningContext, encode_params, join_url};
use crate::credential::DecryptedCredential;
use crate::error::SigningError;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL};
use core_types::Exchange;
use p256::SecretKey;
use p256::ecdsa::{Signature, SigningKey, signature::Signer as _};
use p256::pkcs8::DecodePrivateKey;
use rand::RngCore;
use serde::Serialize;

/// Longest validity a token may carry.
pub const TOKEN_TTL_SECS: i64 = 120;

const ISSUER: &str = "cdp";

#[derive(Debug, Serialize)]
struct JwtHeader<'a> {
    alg: &'static str,
    kid: &'a str,
    nonce: String,
    typ: &'static str,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    sub: &'a str,
    iss: &'static str,
    nbf: i64,
    exp: i64,
    uri: String,
}

/// Signs Coinbase requests with a per-request ES256 JWT.
///
/// The token binds `METHOD host+path` and a two-minute window, so it is minted
/// fresh for every request and never cached.
#[derive(Debug, Clone)]
pub struct BearerSigner {
    base_url: String,
    host: String,
}

impl BearerSigner {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let host = base_url
            .split("://")
            .last()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        Self { base_url, host }
    }

    /// Mints the bearer token for `ctx`.
    pub fn mint_token(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<String, SigningError> {
        let key_name = credential.api_key().trim();
        if key_name.is_empty() {
            return Err(SigningError::MalformedKey("key name is empty".into()));
        }
        let signing_key = parse_signing_key(credential.api_secret())?;

        let nbf = ctx.timestamp_ms().div_euclid(1000);
        if nbf <= 0 {
            return Err(SigningError::Clock(format!(
                "timestamp {} is not a valid epoch",
                ctx.timestamp_ms()
            )));
        }

        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let header = JwtHeader {
            alg: "ES256",
            kid: key_name,
            nonce: hex::encode(nonce),
            typ: "JWT",
        };
        let claims = JwtClaims {
            sub: key_name,
            iss: ISSUER,
            nbf,
            exp: nbf + TOKEN_TTL_SECS,
            uri: format!("{} {}{}", ctx.method(), self.host, ctx.path()),
        };

        let signing_input = format!(
            "{}.{}",
            encode_segment(&header)?,
            encode_segment(&claims)?
        );
        let signature: Signature = signing_key.sign(signing_input.as_bytes());

        Ok(format!(
            "{}.{}",
            signing_input,
            BASE64_URL.encode(signature.to_bytes())
        ))
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, SigningError> {
    let json = serde_json::to_vec(value).map_err(|e| SigningError::Encoding(e.to_string()))?;
    Ok(BASE64_URL.encode(json))
}

/// Accepts SEC1 (`EC PRIVATE KEY`) or PKCS#8 PEM. Keys pasted from JSON often
/// carry literal `\n` sequences instead of newlines.
fn parse_signing_key(pem: &str) -> Result<SigningKey, SigningError> {
    let pem = pem.trim().replace("\\n", "\n");
    let secret = SecretKey::from_sec1_pem(&pem)
        .or_else(|_| SecretKey::from_pkcs8_pem(&pem))
        .map_err(|_| {
            SigningError::MalformedSecret("expected an EC P-256 private key in PEM form".into())
        })?;
    Ok(SigningKey::from(secret))
}

impl RequestSigner for BearerSigner {
    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    fn sign(
        &self,
        credential: &DecryptedCredential,
        ctx: &SigningContext,
    ) -> Result<AuthenticatedRequest, SigningError> {
        let token = self.mint_token(credential, ctx)?;

        // The token covers the path only; the query string rides along unsigned.
        let mut url = join_url(&self.base_url, &ctx.path());
        if !ctx.params().is_empty() {
            url.push('?');
            url.push_str(&encode_params(ctx.params())?);
        }

        Ok(AuthenticatedRequest {
            method: ctx.method(),
            url,
            headers: vec![("Authorization".into(), format!("Bearer {token}"))],
            body: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::ReadEndpoint;
    use p256::ecdsa::{VerifyingKey, signature::Verifier};
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::Value;

    const KEY_NAME: &str = "organizations/org-1/apiKeys/key-1";
    const NOW_MS: i64 = 1_700_000_000_000;

    fn keypair() -> (SecretKey, String) {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_sec1_pem(LineEnding::LF).unwrap().to_string();
        (secret, pem)
    }

    fn decode_segment(segment: &str) -> Value {
        serde_json::from_slice(&BASE64_URL.decode(segment).unwrap()).unwrap()
    }

    #[test]
    fn token_claims_and_signature_verify() {
        let (secret, pem) = keypair();
        let signer = BearerSigner::new("https://api.coinbase.com");
        let credential = DecryptedCredential::new(Exchange::Coinbase, KEY_NAME, pem);
        let ctx = SigningContext::new(ReadEndpoint::CoinbaseAccounts, NOW_MS)
            .with_param("limit", "250");

        let request = signer.sign(&credential, &ctx).unwrap();
        assert_eq!(
            request.url,
            "https://api.coinbase.com/api/v3/brokerage/accounts?limit=250"
        );
        let token = request
            .header("Authorization")
            .unwrap()
            .strip_prefix("Bearer ")
            .unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_segment(parts[0]);
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], KEY_NAME);
        assert_eq!(header["nonce"].as_str().unwrap().len(), 32);

        let claims = decode_segment(parts[1]);
        assert_eq!(claims["sub"], KEY_NAME);
        assert_eq!(claims["iss"], "cdp");
        assert_eq!(claims["nbf"], 1_700_000_000);
        assert_eq!(claims["exp"], 1_700_000_120);
        assert_eq!(claims["uri"], "GET api.coinbase.com/api/v3/brokerage/accounts");

        let signature_bytes = BASE64_URL.decode(parts[2]).unwrap();
        let signature = Signature::from_slice(&signature_bytes).unwrap();
        let verifying_key = VerifyingKey::from(&SigningKey::from(secret));
        verifying_key
            .verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn every_request_gets_a_fresh_token() {
        let (_, pem) = keypair();
        let signer = BearerSigner::new("https://api.coinbase.com");
        let credential = DecryptedCredential::new(Exchange::Coinbase, KEY_NAME, pem);
        let ctx = SigningContext::new(ReadEndpoint::CoinbaseKeyPermissions, NOW_MS);

        let a = signer.mint_token(&credential, &ctx).unwrap();
        let b = signer.mint_token(&credential, &ctx).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn token_is_bound_to_the_path() {
        let (_, pem) = keypair();
        let signer = BearerSigner::new("https://api.coinbase.com/");
        let credential = DecryptedCredential::new(Exchange::Coinbase, KEY_NAME, pem);
        let ctx = SigningContext::new(
            ReadEndpoint::CoinbaseAccountTransactions {
                account_id: crate::endpoints::AccountId::parse("acct-9").unwrap(),
            },
            NOW_MS,
        );
        let token = signer.mint_token(&credential, &ctx).unwrap();
        let claims = decode_segment(token.split('.').nth(1).unwrap());
        assert_eq!(
            claims["uri"],
            "GET api.coinbase.com/v2/accounts/acct-9/transactions"
        );
    }

    #[test]
    fn pkcs8_and_escaped_newlines_are_accepted() {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let pkcs8 = secret.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let escaped = pkcs8.replace('\n', "\\n");
        assert!(parse_signing_key(&pkcs8).is_ok());
        assert!(parse_signing_key(&escaped).is_ok());
    }

    #[test]
    fn garbage_key_is_a_signing_error() {
        let signer = BearerSigner::new("https://api.coinbase.com");
        let credential = DecryptedCredential::new(Exchange::Coinbase, KEY_NAME, "not a pem");
        let ctx = SigningContext::new(ReadEndpoint::CoinbaseAccounts, NOW_MS);
        assert!(matches!(
            signer.sign(&credential, &ctx),
            Err(SigningError::MalformedSecret(_))
        ));

        let credential = DecryptedCredential::new(Exchange::Coinbase, " ", "irrelevant");
        assert!(matches!(
            signer.sign(&credential, &ctx),
            Err(SigningError::MalformedKey(_))
        ));
    }
}
