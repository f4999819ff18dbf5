//! Key and hash primitives.
//!
//! Every object in the system is named by a 16-byte MD5 in one of two roles:
//! a *content key* (MD5 of the decoded file) or an *encoded key* (MD5 of the
//! stored container's header region). Both are the same shape on disk and on
//! the wire: 32 lowercase hex characters, partitioned two levels deep.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// A 16-byte MD5 key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key([u8; 16]);

impl Key {
    pub const ZERO: Key = Key([0u8; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse 32 hex characters.
    pub fn from_hex(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != 32 {
            return Err(Error::InvalidKey {
                value: value.to_string(),
            });
        }
        let bytes = hex::decode(value).map_err(|_| Error::InvalidKey {
            value: value.to_string(),
        })?;
        Ok(Self(bytes.try_into().unwrap()))
    }

    /// Read a key from the front of a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = bytes
            .get(..16)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidKey {
                value: hex::encode(bytes),
            })?;
        Ok(Self(bytes))
    }

    /// The MD5 of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// The two-level partitioned path fragment: `xx/yy/<full hex>`.
    pub fn partition(&self) -> String {
        partition_hex(&self.to_hex()).expect("32-hex key always partitions")
    }
}

/// Partition any hex digest two levels deep: `0123abcd…` → `01/23/0123abcd…`.
///
/// Digests shorter than two byte pairs cannot be partitioned.
pub fn partition_hex(digest: &str) -> Result<String> {
    if digest.len() < 4 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidKey {
            value: digest.to_string(),
        });
    }
    Ok(format!("{}/{}/{}", &digest[0..2], &digest[2..4], digest))
}

/// MD5 of `data` as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
