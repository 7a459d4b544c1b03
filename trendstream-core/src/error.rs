//! Error types for trendstream-core

use thiserror::Error;

/// Main error type for the trendstream-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Delivery to the collection endpoint failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Session or durable storage is unavailable
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for trendstream-core
pub type Result<T> = std::result::Result<T, Error>;
