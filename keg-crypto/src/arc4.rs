//! ARC4 stream cipher for BLTE encrypted chunks.

use cipher::consts::U32;
use cipher::{KeyInit, StreamCipher};
use rc4::Rc4;

use crate::Result;
use crate::error::CryptoError;

/// Decrypt a BLTE chunk with ARC4.
///
/// The RC4 key is `base_key(16) || iv(4) || chunk_index_le(4)` zero-padded
/// to 32 bytes.
pub fn decrypt_arc4(data: &[u8], key: &[u8; 16], iv: &[u8], chunk_index: usize) -> Result<Vec<u8>> {
    if iv.len() != 4 {
        return Err(CryptoError::InvalidIvSize {
            expected: 4,
            actual: iv.len(),
        });
    }

    let mut arc4_key = [0u8; 32];
    arc4_key[..16].copy_from_slice(key);
    arc4_key[16..20].copy_from_slice(iv);
    arc4_key[20..24].copy_from_slice(&(chunk_index as u32).to_le_bytes());

    let mut cipher: Rc4<U32> = Rc4::new(&arc4_key.into());
    let mut output = data.to_vec();
    cipher.apply_keystream(&mut output);

    Ok(output)
}

/// Encrypt a BLTE chunk with ARC4. Stream ciphers are symmetric.
pub fn encrypt_arc4(data: &[u8], key: &[u8; 16], iv: &[u8], chunk_index: usize) -> Result<Vec<u8>> {
    decrypt_arc4(data, key, iv, chunk_index)
}
