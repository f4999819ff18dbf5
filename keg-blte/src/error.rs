//! Error types for BLTE parsing, decoding and encoding

use thiserror::Error;

/// Result type for BLTE operations
pub type Result<T> = std::result::Result<T, Error>;

/// BLTE error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid BLTE magic bytes
    #[error("Invalid BLTE magic: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Header size field is nonsense
    #[error("Invalid header size: {0}")]
    InvalidHeaderSize(u32),

    /// Chunk table flag byte is not the supported 0x0F format
    #[error("Unsupported chunk table format: {0:#04x}")]
    UnsupportedTableFormat(u8),

    /// Chunk count does not match the header size
    #[error("Invalid chunk count: {0}")]
    InvalidChunkCount(u32),

    /// A chunk begins with an unknown mode byte
    #[error("Unknown chunk mode: {0:#04x}")]
    UnknownMode(u8),

    /// Input ended before the declared data did
    #[error("Truncated data: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    /// A digest check failed
    #[error("Checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// Extra bytes follow the declared end of the blob
    #[error("{0} extra bytes at the end of the blob")]
    TrailingData(usize),

    /// An encrypted chunk names a key that is not provisioned
    #[error("Missing decryption key: {0:016x}")]
    MissingKey(u64),

    /// An encrypted chunk's envelope is malformed
    #[error("Invalid encrypted chunk: {0}")]
    InvalidEncryptedChunk(String),

    /// Unsupported cipher byte inside an encrypted chunk
    #[error("Unsupported encryption type: {0:#04x}")]
    UnsupportedEncryptionType(u8),

    /// Decompression failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// Cipher error from keg-crypto
    #[error("Crypto error: {0}")]
    Crypto(#[from] keg_crypto::CryptoError),
}
