use crate::auth::AuthenticatedRequest;
use crate::endpoints::HttpMethod;
use crate::error::ApiError;
use async_trait::async_trait;
use std::time::Duration;

/// What came back from the wire, before any exchange-specific interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The HTTP seam. Production uses [`ReqwestTransport`]; tests script responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a signed request.
    async fn execute(&self, request: AuthenticatedRequest) -> Result<RawResponse, ApiError>;

    /// Sends an unauthenticated GET (public market data).
    async fn get_public(&self, url: &str) -> Result<RawResponse, ApiError>;
}

/// `reqwest`-backed transport with a per-request timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vaultsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn into_raw(response: reqwest::Response) -> Result<RawResponse, ApiError> {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else if error.is_connect() || error.is_request() || error.is_body() {
        ApiError::Network(error.to_string())
    } else {
        ApiError::RequestBuild(error)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: AuthenticatedRequest) -> Result<RawResponse, ApiError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        Self::into_raw(response).await
    }

    async fn get_public(&self, url: &str) -> Result<RawResponse, ApiError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::into_raw(response).await
    }
}
