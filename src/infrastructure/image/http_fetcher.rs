//! HTTP adapter for the image fetch port.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ImageFetchPort;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent sent with image requests.
pub const DEFAULT_USER_AGENT: &str = concat!("pixcache/", env!("CARGO_PKG_VERSION"));

/// Fetches image bytes over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    /// Creates a fetcher with the given timeout and user agent.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CacheError::NetworkError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Creates a fetcher with default settings.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> CacheResult<Self> {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS), DEFAULT_USER_AGENT)
    }
}

#[async_trait]
impl ImageFetchPort for HttpImageFetcher {
    async fn fetch_bytes(&self, url: &str) -> CacheResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::NetworkError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CacheError::NetworkError(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::NetworkError(format!("Failed to read body: {e}")))?;

        trace!(url = %url, size = bytes.len(), "Fetched image bytes");
        Ok(bytes)
    }
}
