//! Error types for dexsync-core

use thiserror::Error;

/// Result type alias using dexsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dexsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-up fetch or live channel handshake failed
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single inbound update could not be decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure is a transient network condition that a later
    /// attempt may resolve.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }
}
