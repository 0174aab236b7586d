//! Port definition for sampling process memory.

/// Reports the resident memory of the current process.
#[cfg_attr(test, mockall::automock)]
pub trait MemorySamplerPort: Send + Sync {
    /// Returns resident memory in bytes, or None if it cannot be read.
    fn resident_bytes(&self) -> Option<u64>;
}
