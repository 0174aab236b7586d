//! Port definition for fetching raw image bytes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::CacheResult;

/// Outbound port to the network layer.
///
/// Any transport failure is reported as
/// [`CacheError::NetworkError`](crate::domain::errors::CacheError::NetworkError).
#[async_trait]
pub trait ImageFetchPort: Send + Sync {
    /// Fetches the bytes behind a URL.
    async fn fetch_bytes(&self, url: &str) -> CacheResult<Bytes>;
}
