//! Bounded exponential backoff with jitter around one exchange call.

use api_client::ApiError;
use backoff::ExponentialBackoff;
use backoff::future::retry;
use configuration::SyncSettings;
use std::future::Future;
use std::time::Duration;

/// How transient failures are retried. Permanent and credential-fatal
/// errors are returned on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_interval: Duration::from_millis(settings.backoff_initial_ms),
            max_interval: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            randomization_factor: 0.5,
            multiplier: 2.0,
            // Attempts are bounded by count; the run deadline bounds time.
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. A server-sent `Retry-After` replaces the computed delay.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_retries = self.max_retries;
        let mut attempt = 0u32;

        retry(self.backoff(), || {
            attempt += 1;
            let current = attempt;
            let call = operation();
            async move {
                match call.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() && current <= max_retries => {
                        tracing::warn!(
                            item = label,
                            attempt = current,
                            error = %e,
                            "Transient failure, backing off."
                        );
                        match e.retry_after() {
                            Some(wait) => Err(backoff::Error::retry_after(e, wait)),
                            None => Err(backoff::Error::transient(e)),
                        }
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}
