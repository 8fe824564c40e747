use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, warn};

use crate::core::errors::{TranslationError, TranslationResult};
use crate::core::types::TranslationProviderKind;

/// Retry configuration
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_RETRY_DELAY_MS: u64 = 1000;
pub(crate) const MAX_RETRY_DELAY_MS: u64 = 10000;

/// One outbound translation call
#[derive(Debug, Clone, Copy)]
pub struct TranslationCall<'a> {
    pub text: &'a str,
    /// Source language code or `auto`
    pub source: &'a str,
    pub target: &'a str,
    pub api_key: &'a str,
}

/// A remote machine translation backend
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    fn kind(&self) -> TranslationProviderKind;

    async fn translate(&self, call: TranslationCall<'_>) -> TranslationResult<String>;
}

/// Send one request and turn a non-success status into `BadStatus`.
/// Retries are driven by the caller so backoff never holds a limiter slot.
pub(crate) async fn send_request(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> TranslationResult<reqwest::Response> {
    let response = request.send().await.map_err(|e| {
        error!(
            "{}: Request failed: {} (retryable: {})",
            provider,
            e,
            e.is_timeout() || e.is_connect()
        );
        TranslationError::from(e)
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!("{}: Provider returned {}: {}", provider, status, body);
    Err(TranslationError::BadStatus {
        provider,
        status: status.as_u16(),
        body,
    })
}

/// Delay before retry `attempt` (1-based): doubles from the initial delay up to the cap
pub(crate) fn retry_delay(initial: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    (initial * factor).min(Duration::from_millis(MAX_RETRY_DELAY_MS))
}

/// Shared HTTP client builder for providers
pub(crate) fn http_client(timeout: Duration) -> TranslationResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}
