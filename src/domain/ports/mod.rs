mod image_cache_port;
mod image_fetch_port;
mod memory_sampler_port;

pub use image_cache_port::{ImageCachePort, ImageLoaderPort};
pub use image_fetch_port::ImageFetchPort;
pub use memory_sampler_port::MemorySamplerPort;
