//! Armadillo session keys.
//!
//! Some remotes serve CDN objects encrypted under a per-product "armadillo"
//! key. The key file is 20 bytes: 16 bytes of Salsa20 key material followed
//! by the first 4 bytes of the key's MD5, which lets the file check itself.

use std::fs;
use std::path::Path;

use md5::{Digest, Md5};

use crate::Result;
use crate::error::CryptoError;
use crate::salsa20::decrypt_salsa20;

/// Size of the key material in an armadillo key file.
pub const ARMADILLO_KEY_SIZE: usize = 16;

/// Size of the trailing check digest.
pub const ARMADILLO_DIGEST_SIZE: usize = 4;

/// A verified armadillo key.
#[derive(Debug, Clone)]
pub struct ArmadilloKey {
    key: [u8; ARMADILLO_KEY_SIZE],
}

impl ArmadilloKey {
    /// Parse and self-check a 20-byte armadillo key blob.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != ARMADILLO_KEY_SIZE + ARMADILLO_DIGEST_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: ARMADILLO_KEY_SIZE + ARMADILLO_DIGEST_SIZE,
                actual: data.len(),
            });
        }

        let key: [u8; ARMADILLO_KEY_SIZE] = data[..ARMADILLO_KEY_SIZE].try_into().unwrap();
        let digest = Md5::digest(key);

        let expected = &data[ARMADILLO_KEY_SIZE..];
        if &digest[..ARMADILLO_DIGEST_SIZE] != expected {
            return Err(CryptoError::CheckDigestMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(&digest[..ARMADILLO_DIGEST_SIZE]),
            });
        }

        Ok(Self { key })
    }

    /// Load a `<name>.ak` key file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Decrypt a whole CDN object.
    ///
    /// The Salsa20 nonce is the last 8 bytes of the object's own 16-byte key.
    pub fn decrypt_object(&self, object_key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
        let mut output = data.to_vec();
        self.object_cipher(object_key).apply(&mut output);
        Ok(output)
    }

    /// A streaming cipher for one object, for callers that decrypt
    /// incrementally as bytes arrive.
    pub fn object_cipher(&self, object_key: &[u8; 16]) -> ObjectCipher {
        use cipher::KeyIvInit;

        let mut extended_key = [0u8; 32];
        extended_key[..16].copy_from_slice(&self.key);
        extended_key[16..].copy_from_slice(&self.key);

        let nonce: &[u8; 8] = object_key[8..].try_into().unwrap();
        ObjectCipher {
            inner: Salsa20::new(&extended_key.into(), nonce.into()),
        }
    }

    pub fn key(&self) -> &[u8; ARMADILLO_KEY_SIZE] {
        &self.key
    }
}

use cipher::StreamCipher;
use salsa20::Salsa20;

/// Keystream state for one object's decryption. Apply to consecutive
/// ciphertext segments in order.
pub struct ObjectCipher {
    inner: Salsa20,
}

impl ObjectCipher {
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}
