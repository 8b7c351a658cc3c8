//! Error types for the tag-aware cache facade.

use thiserror::Error;

/// Errors surfaced by the cache facade.
///
/// Pool I/O failures are swallowed into boolean operation results by the
/// adapter; this enum only reaches callers at construction time or from
/// the codec layer.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid constructor argument (namespace charset violation)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A payload failed to pack or unpack
    #[error("Codec error: {0}")]
    Codec(String),

    /// Backing pool failure
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors reported by a backing key/value pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Network or I/O failure reaching the backend
    #[error("I/O error: {0}")]
    Io(String),

    /// Backend reported an error status
    #[error("Backend error: {0}")]
    Backend(String),

    /// Operation not supported by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
