//! Error types for the object store

use thiserror::Error;

use crate::store::ObjectKind;

/// Result type for object store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Object store errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP failure
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Unexpected HTTP status
    #[error("Unexpected status {status} for {url}")]
    Status { url: String, status: u16 },

    /// The object exists nowhere we can reach
    #[error("{kind} object not found: {key}")]
    Missing { kind: ObjectKind, key: String },

    /// An ingested or read object failed its digest check
    #[error("Integrity failure for {what}: expected {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    /// A range read fell outside the archive
    #[error("Range {offset}+{size} outside object {key} ({len} bytes)")]
    BadRange {
        key: String,
        offset: u64,
        size: u64,
        len: u64,
    },

    /// The store has no remote to delegate to
    #[error("No remote configured for {kind} object {key}")]
    NoRemote { kind: ObjectKind, key: String },

    /// Format-level failure while verifying
    #[error(transparent)]
    Format(#[from] keg_formats::Error),

    /// BLTE-level failure while verifying
    #[error(transparent)]
    Blte(#[from] keg_blte::Error),
}
