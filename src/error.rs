//! Error types for Sonance.

use thiserror::Error;

/// Result type alias using Sonance's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sonance operations.
///
/// Exhaustion of lock-free pools is not an error: those APIs hand the value
/// back (`Result<(), T>`) so the caller can fall back to the heap.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested segment exceeds the per-segment cap.
    #[error("segment too large: {size} bytes exceeds limit of {max} bytes")]
    SegmentTooLarge {
        /// Requested size in bytes.
        size: usize,
        /// The cap.
        max: usize,
    },

    /// Memory allocation or mapping failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A segment failed validation (foreign, truncated or corrupt).
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// The calling thread could not be promoted to realtime scheduling.
    #[error("realtime scheduling unavailable: {0}")]
    Realtime(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
