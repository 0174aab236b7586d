//! Domain entity definitions.

mod image;

pub use image::{CacheKey, CachedImage, ImageSource, LoadedImage, LoadingPhase, LoadingState};
