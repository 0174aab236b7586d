//! Off-thread image decoding.

use bytes::Bytes;
use tracing::error;

use crate::domain::entities::CachedImage;
use crate::domain::errors::{CacheError, CacheResult};

/// Decodes encoded image bytes on the blocking pool.
///
/// # Errors
/// Returns `DecodeError` if the bytes are not a supported image.
pub async fn decode_image(bytes: Bytes) -> CacheResult<CachedImage> {
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| {
            error!(error = %e, "Decode task panicked");
            CacheError::DecodeError(format!("Decode task panicked: {e}"))
        })?
        .map_err(|e| CacheError::DecodeError(format!("Failed to decode image: {e}")))?;

    Ok(CachedImage::new(decoded))
}
