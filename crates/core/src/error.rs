//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("invalid global id: {0}")]
    InvalidGlobalId(String),

    #[error("invalid registry type: {0}")]
    InvalidRegistryType(String),

    #[error("invalid cleanup policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid cleanup metrics: {0}")]
    InvalidMetrics(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
