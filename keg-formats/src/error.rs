//! Error types for format codecs

use thiserror::Error;

/// Result type for format codecs
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the format codecs.
///
/// Codecs never retry: they succeed or fail deterministically with the
/// position and reason.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A file does not start with the expected magic
    #[error("Bad magic for {format} file")]
    BadMagic { format: &'static str },

    /// Structural parse failure
    #[error("Parse error in {format} at offset {offset}: {reason}")]
    Parse {
        format: &'static str,
        offset: usize,
        reason: String,
    },

    /// A digest check failed
    #[error("Checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// A lookup key has no entry
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A configuration line could not be parsed
    #[error("Config syntax error: {line:?}")]
    ConfigSyntax { line: String },

    /// A configuration value has the wrong shape for its key
    #[error("Config value for {key:?} is not a {expected}: {value:?}")]
    ConfigValue {
        key: String,
        expected: &'static str,
        value: String,
    },

    /// A hex key string is malformed
    #[error("Invalid key: {value:?}")]
    InvalidKey { value: String },

    /// A tag name is not declared by the manifest
    #[error("Unknown tag: {name}")]
    UnknownTag { name: String },
}
