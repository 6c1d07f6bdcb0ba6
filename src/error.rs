//! Error types for tollgate.

use thiserror::Error;

use crate::macaroon::MacaroonError;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tollgate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wallet backend error.
    #[error("wallet error: {0}")]
    Wallet(String),

    /// Trust resolver error.
    #[error("trust resolver error: {0}")]
    Trust(String),

    /// Credential (macaroon) error.
    #[error("credential error: {0}")]
    Credential(#[from] MacaroonError),

    /// Identifier extraction error.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
