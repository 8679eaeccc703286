//! Error types for pool and quota persistence

/// Errors from the quota store and its record encoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store encoding error: {0}")]
    Encoding(String),
}

/// Result alias for key-pool operations.
pub type Result<T> = std::result::Result<T, Error>;
