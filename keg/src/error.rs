//! Error types for the repository engine

use thiserror::Error;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, Error>;

/// Repository engine errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store failure
    #[error(transparent)]
    Store(#[from] keg_cdn::Error),

    /// Format codec failure
    #[error(transparent)]
    Format(#[from] keg_formats::Error),

    /// BLTE codec failure
    #[error(transparent)]
    Blte(#[from] keg_blte::Error),

    /// PSV codec failure
    #[error(transparent)]
    Psv(#[from] keg_psv::Error),

    /// Crypto failure
    #[error(transparent)]
    Crypto(#[from] keg_crypto::CryptoError),

    /// State cache database failure
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Patch server transport failure
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Patch server returned an unexpected status
    #[error("Unexpected status {status} for {url}")]
    Status { url: String, status: u16 },

    /// An optional endpoint has no data
    #[error("No data for endpoint {endpoint}")]
    NoData { endpoint: String },

    /// Something the operation needs does not exist
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A named decryption key is not provisioned
    #[error("Missing decryption key: {name}")]
    MissingKey { name: String },

    /// `keg.conf` is unusable
    #[error("Config error for {key:?}: {reason}")]
    Config { key: String, reason: String },

    /// A JSON blob failed to parse
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
