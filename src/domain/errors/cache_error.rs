//! Image cache error types.

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while acquiring an image.
///
/// Cloneable so one terminal result can be handed to every observer of a
/// coalesced fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The fetch could not complete.
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Bytes were fetched but are not a valid image.
    #[error("Decode error: {0}")]
    DecodeError(String),
    /// Disk read or write failed. Absorbed inside the disk tier.
    #[error("Storage error: {0}")]
    StorageError(String),
    /// The load was cancelled before it finished.
    #[error("Image load cancelled")]
    Cancelled,
}
