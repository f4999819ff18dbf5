//! Error types for crypto operations.

use thiserror::Error;

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during crypto operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A named decryption key is not provisioned.
    #[error("decryption key not found: {0}")]
    KeyNotFound(String),

    /// Key material failed to parse.
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Key material has the wrong size.
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// IV has the wrong size.
    #[error("invalid IV size: expected {expected}, got {actual}")]
    InvalidIvSize { expected: usize, actual: usize },

    /// An armadillo key failed its self-check.
    #[error("armadillo key check digest mismatch: expected {expected}, got {actual}")]
    CheckDigestMismatch { expected: String, actual: String },

    /// IO error reading key files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
