//! Domain types for image caching.

use std::sync::Arc;

use crate::domain::errors::CacheError;

/// Canonical identifier for a remote image.
///
/// Wraps the source identifier (the fetch URL) unchanged, so the same source
/// always maps to the same key in every tier. The on-disk filename uses
/// [`CacheKey::digest`] instead of the raw source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a key from a source identifier.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Returns the source identifier this key was built from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a filesystem-safe one-way hash of the source.
    #[must_use]
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A decoded image together with its estimated memory cost.
///
/// Cloning is cheap: the pixel data is shared.
#[derive(Debug, Clone)]
pub struct CachedImage {
    image: Arc<image::DynamicImage>,
    cost: usize,
}

impl CachedImage {
    /// Wraps a decoded image, estimating its cost from the pixel buffer size.
    #[must_use]
    pub fn new(image: image::DynamicImage) -> Self {
        let cost = image.as_bytes().len();
        Self {
            image: Arc::new(image),
            cost,
        }
    }

    /// Returns the decoded image.
    #[must_use]
    pub fn image(&self) -> &Arc<image::DynamicImage> {
        &self.image
    }

    /// Returns the estimated cost in bytes.
    #[must_use]
    pub const fn cost(&self) -> usize {
        self.cost
    }

    /// Image width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Image height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Returns true if both handles share the same pixel data.
    #[must_use]
    pub fn same_image(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

/// Loading state of a single key, shared by every observer of that key.
#[derive(Debug, Clone, Default)]
pub enum LoadingState {
    /// Nothing requested yet, or the last request was cancelled.
    #[default]
    Idle,
    /// A network fetch is in flight.
    Loading,
    /// The image is available.
    Loaded(CachedImage),
    /// The last request failed.
    Failed(CacheError),
}

impl LoadingState {
    /// Returns the phase of this state without its payload.
    #[must_use]
    pub const fn phase(&self) -> LoadingPhase {
        match self {
            Self::Idle => LoadingPhase::Idle,
            Self::Loading => LoadingPhase::Loading,
            Self::Loaded(_) => LoadingPhase::Loaded,
            Self::Failed(_) => LoadingPhase::Failed,
        }
    }

    /// Returns true if a fetch is in flight.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns true if the image is available.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Returns true if loading failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true for `Loaded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded(_) | Self::Failed(_))
    }

    /// Returns the image if loaded.
    #[must_use]
    pub const fn image(&self) -> Option<&CachedImage> {
        match self {
            Self::Loaded(image) => Some(image),
            _ => None,
        }
    }
}

/// Payload-free view of a [`LoadingState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingPhase {
    /// See [`LoadingState::Idle`].
    Idle,
    /// See [`LoadingState::Loading`].
    Loading,
    /// See [`LoadingState::Loaded`].
    Loaded,
    /// See [`LoadingState::Failed`].
    Failed,
}

impl std::fmt::Display for LoadingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Loaded => write!(f, "loaded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// The key the image was requested under.
    pub key: CacheKey,
    /// The decoded image.
    pub image: CachedImage,
    /// Where the image was found.
    pub source: ImageSource,
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from the in-memory LRU cache.
    MemoryCache,
    /// Loaded from the disk cache.
    DiskCache,
    /// Downloaded from the network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}
