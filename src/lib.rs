//! Pixcache - tiered image acquisition and caching.
//!
//! Images are served from a bounded in-memory LRU, then a size-bounded disk
//! store, then the network. Concurrent requests for the same image share one
//! download, and every caller observes the same loading state.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing cache tiers and adapters.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "pixcache";
