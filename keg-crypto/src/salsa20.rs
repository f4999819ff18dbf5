//! Salsa20 stream cipher for BLTE encrypted chunks.

use cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;

use crate::Result;
use crate::error::CryptoError;

/// Decrypt a BLTE chunk with Salsa20.
///
/// BLTE uses a reduced-parameter Salsa20 variant:
/// - the 16-byte key is extended to 32 bytes by duplication
/// - the 4-byte IV is extended to 8 bytes by duplication
/// - the chunk index is XORed into the first 4 bytes of the IV
pub fn decrypt_salsa20(
    data: &[u8],
    key: &[u8; 16],
    iv: &[u8],
    chunk_index: usize,
) -> Result<Vec<u8>> {
    if iv.len() != 4 {
        return Err(CryptoError::InvalidIvSize {
            expected: 4,
            actual: iv.len(),
        });
    }

    let mut extended_key = [0u8; 32];
    extended_key[..16].copy_from_slice(key);
    extended_key[16..].copy_from_slice(key);

    let mut extended_iv = [0u8; 8];
    extended_iv[..4].copy_from_slice(iv);
    extended_iv[4..].copy_from_slice(iv);
    for (b, i) in extended_iv
        .iter_mut()
        .zip((chunk_index as u32).to_le_bytes())
    {
        *b ^= i;
    }

    let mut cipher = Salsa20::new(&extended_key.into(), &extended_iv.into());
    let mut output = data.to_vec();
    cipher.apply_keystream(&mut output);

    Ok(output)
}

/// Encrypt a BLTE chunk with Salsa20. Stream ciphers are symmetric.
pub fn encrypt_salsa20(
    data: &[u8],
    key: &[u8; 16],
    iv: &[u8],
    chunk_index: usize,
) -> Result<Vec<u8>> {
    decrypt_salsa20(data, key, iv, chunk_index)
}
