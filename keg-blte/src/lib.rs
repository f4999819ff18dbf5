//! BLTE block-table container codec.
//!
//! A BLTE blob holds one logical file as one or more encoded chunks behind a
//! chunk table. The MD5 of the header region is the blob's *encoded key*
//! (ekey), the name it is stored under. Decoding verifies that identity,
//! each chunk's own MD5, and applies the per-chunk mode: raw, zlib, LZ4,
//! recursive BLTE, or encrypted (Salsa20/ARC4 wrapping an inner mode).

mod decode;
mod encode;
mod error;
mod header;

pub use decode::{BlteFile, DecodedChunks, decode, verify};
pub use encode::{ChunkPlan, encode, encode_single};
pub use error::{Error, Result};
pub use header::{BlteHeader, ChunkInfo};

/// 16-byte MD5 digest.
pub type Md5 = [u8; 16];

/// Length of an MD5 digest in bytes.
pub const MD5_LENGTH: usize = 16;

/// BLTE magic bytes.
pub const BLTE_MAGIC: [u8; 4] = *b"BLTE";

/// Chunk encoding modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Mode 'N': raw bytes.
    Raw,
    /// Mode 'Z': a zlib stream.
    Zlib,
    /// Mode '4': an LZ4 frame with explicit sizes.
    Lz4,
    /// Mode 'F': a nested BLTE blob.
    Frame,
    /// Mode 'E': an encrypted chunk wrapping an inner mode.
    Encrypted,
}

impl Mode {
    /// Parse a chunk's leading mode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'N' => Some(Self::Raw),
            b'Z' => Some(Self::Zlib),
            b'4' => Some(Self::Lz4),
            b'F' => Some(Self::Frame),
            b'E' => Some(Self::Encrypted),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Raw => b'N',
            Self::Zlib => b'Z',
            Self::Lz4 => b'4',
            Self::Frame => b'F',
            Self::Encrypted => b'E',
        }
    }
}

/// Rewrite a blob that carries extraneous trailing bytes, truncating it to
/// the exact length the chunk table declares.
///
/// Single-chunk blobs (no table) declare no length and are returned as-is.
/// A blob *shorter* than its declared length is truncated input and fails.
pub fn fix(data: &[u8]) -> Result<Vec<u8>> {
    let file = BlteFile::parse(data.to_vec())?;
    let declared = file.declared_len();

    if file.header().is_single_chunk() {
        return Ok(file.into_data());
    }

    match data.len().cmp(&declared) {
        std::cmp::Ordering::Less => Err(Error::Truncated {
            expected: declared as u64,
            actual: data.len() as u64,
        }),
        std::cmp::Ordering::Equal => Ok(file.into_data()),
        std::cmp::Ordering::Greater => {
            tracing::debug!(
                "Truncating {} trailing bytes from BLTE blob",
                data.len() - declared
            );
            let mut data = file.into_data();
            data.truncate(declared);
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bytes() {
        for byte in [b'N', b'Z', b'4', b'F', b'E'] {
            assert_eq!(Mode::from_byte(byte).unwrap().as_byte(), byte);
        }
        assert!(Mode::from_byte(b'X').is_none());
    }

    #[test]
    fn test_fix_truncates_trailing_garbage() {
        let (mut blob, ekey) = encode(&[ChunkPlan::raw(b"payload".to_vec())], None).unwrap();
        let clean_len = blob.len();
        blob.extend_from_slice(b"GARBAGE");

        let fixed = fix(&blob).unwrap();
        assert_eq!(fixed.len(), clean_len);
        assert_eq!(decode(&fixed, Some(&ekey), None).unwrap(), b"payload");
    }

    #[test]
    fn test_fix_rejects_short_input() {
        let (blob, _) = encode(&[ChunkPlan::raw(b"payload".to_vec())], None).unwrap();
        let err = fix(&blob[..blob.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }
}
