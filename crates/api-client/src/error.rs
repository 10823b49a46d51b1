use std::time::Duration;
use thiserror::Error;

/// Failure to turn a logical request into an authenticated one.
///
/// Always permanent for the credential: retrying with the same inputs cannot help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("API secret is malformed: {0}")]
    MalformedSecret(String),

    #[error("API key is malformed: {0}")]
    MalformedKey(String),

    #[error("Signer for {signer} cannot sign a {request} request")]
    ExchangeMismatch { signer: String, request: String },

    #[error("Request requires a nonce but none was supplied")]
    MissingNonce,

    #[error("Failed to encode request parameters: {0}")]
    Encoding(String),

    #[error("Clock error: {0}")]
    Clock(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to build the HTTP request: {0}")]
    RequestBuild(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by the exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Local rate budget not available within {0:?}")]
    BudgetExhausted(Duration),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("API key has been revoked or is unknown: {0}")]
    KeyRevoked(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("The API request returned an error (HTTP {status}, code {code:?}): {message}")]
    Exchange {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),
}

impl ApiError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RequestBuild(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::RateLimited { .. }
            | ApiError::BudgetExhausted(_) => true,
            ApiError::Exchange { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Ends all work for the credential and flips it out of `Active`.
    pub fn is_credential_fatal(&self) -> bool {
        matches!(
            self,
            ApiError::Authentication(_)
                | ApiError::KeyRevoked(_)
                | ApiError::PermissionDenied(_)
                | ApiError::Signing(_)
        )
    }

    /// Server-suggested wait, when the exchange sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
