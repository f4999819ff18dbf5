//! BLTE decoding

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use md5::{Digest, Md5 as Md5Hasher};
use std::io::{Cursor, Read};
use tracing::trace;

use keg_crypto::KeyTable;
use keg_crypto::arc4::decrypt_arc4;
use keg_crypto::salsa20::decrypt_salsa20;

use crate::header::BlteHeader;
use crate::{Error, Md5, Mode, Result};

/// A parsed BLTE blob held in memory.
///
/// Parsing reads only the header; chunk payloads are verified and decoded
/// lazily through [`BlteFile::decoded_chunks`], which can be restarted as
/// many times as needed.
pub struct BlteFile {
    data: Vec<u8>,
    header: BlteHeader,
}

impl BlteFile {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = BlteHeader::parse(&data)?;
        Ok(Self { data, header })
    }

    pub fn header(&self) -> &BlteHeader {
        &self.header
    }

    /// Total blob length the chunk table declares.
    pub fn declared_len(&self) -> usize {
        self.header.declared_len()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Verify the blob's identity against its expected ekey.
    ///
    /// For the chunk-table form the ekey is the MD5 of the header region
    /// alone; for the single-chunk form it covers the whole blob.
    pub fn verify_key(&self, expected: &Md5) -> Result<()> {
        let covered = if self.header.is_single_chunk() {
            &self.data[..]
        } else {
            &self.data[..self.header.header_region_len()]
        };

        let actual: Md5 = Md5Hasher::digest(covered).into();
        if &actual != expected {
            return Err(Error::ChecksumMismatch {
                what: "BLTE header",
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    /// The encoded bytes of chunk `index`, after verifying its table MD5.
    pub fn encoded_chunk(&self, index: usize) -> Result<&[u8]> {
        let info = &self.header.chunks()[index];
        let end = info.offset + info.encoded_size as usize;
        if end > self.data.len() {
            return Err(Error::Truncated {
                expected: end as u64,
                actual: self.data.len() as u64,
            });
        }

        let chunk = &self.data[info.offset..end];
        if let Some(expected) = &info.checksum {
            let actual: Md5 = Md5Hasher::digest(chunk).into();
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    what: "BLTE chunk",
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }
        Ok(chunk)
    }

    /// A restartable iterator over verified, decoded chunk buffers.
    pub fn decoded_chunks<'a>(&'a self, keys: Option<&'a KeyTable>) -> DecodedChunks<'a> {
        DecodedChunks {
            file: self,
            keys,
            next: 0,
        }
    }

    /// Decode the whole blob into one buffer.
    pub fn decode_all(&self, keys: Option<&KeyTable>) -> Result<Vec<u8>> {
        let capacity = self.header.total_decoded_size().unwrap_or(0) as usize;
        let mut out = Vec::with_capacity(capacity);
        for chunk in self.decoded_chunks(keys) {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Iterator over decoded chunks; each step verifies, then decodes.
pub struct DecodedChunks<'a> {
    file: &'a BlteFile,
    keys: Option<&'a KeyTable>,
    next: usize,
}

impl Iterator for DecodedChunks<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.file.header.chunk_count() {
            return None;
        }
        let index = self.next;
        self.next += 1;

        Some(
            self.file
                .encoded_chunk(index)
                .and_then(|chunk| decode_chunk(chunk, index, self.keys)),
        )
    }
}

/// Decode a single encoded chunk, dispatching on its mode byte.
pub fn decode_chunk(chunk: &[u8], chunk_index: usize, keys: Option<&KeyTable>) -> Result<Vec<u8>> {
    let Some((&mode_byte, body)) = chunk.split_first() else {
        return Err(Error::Truncated {
            expected: 1,
            actual: 0,
        });
    };

    let mode = Mode::from_byte(mode_byte).ok_or(Error::UnknownMode(mode_byte))?;
    trace!("Decoding chunk {chunk_index} with mode {mode:?}");

    match mode {
        Mode::Raw => Ok(body.to_vec()),
        Mode::Zlib => {
            let mut out = Vec::new();
            ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| Error::DecompressionFailed(format!("zlib: {e}")))?;
            Ok(out)
        }
        Mode::Lz4 => decode_lz4(body),
        Mode::Frame => decode(body, None, keys),
        Mode::Encrypted => {
            let plaintext = decrypt_chunk(body, chunk_index, keys)?;
            decode_chunk(&plaintext, chunk_index, keys)
        }
    }
}

/// Mode '4': `decoded_size:u32le | compressed_size:u32le | lz4 block`.
fn decode_lz4(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 8 {
        return Err(Error::Truncated {
            expected: 8,
            actual: body.len() as u64,
        });
    }

    let mut cursor = Cursor::new(body);
    let decoded_size = cursor.read_u32::<LittleEndian>()? as usize;
    let compressed_size = cursor.read_u32::<LittleEndian>()? as usize;

    if compressed_size + 8 != body.len() {
        return Err(Error::DecompressionFailed(format!(
            "LZ4 size mismatch: declared {} bytes, have {}",
            compressed_size + 8,
            body.len()
        )));
    }

    lz4_flex::decompress(&body[8..], decoded_size)
        .map_err(|e| Error::DecompressionFailed(format!("LZ4: {e}")))
}

/// Mode 'E' envelope: key name, IV, cipher byte, ciphertext.
fn decrypt_chunk(body: &[u8], chunk_index: usize, keys: Option<&KeyTable>) -> Result<Vec<u8>> {
    if body.len() < 21 {
        return Err(Error::InvalidEncryptedChunk(format!(
            "encrypted chunk too short: {} bytes",
            body.len()
        )));
    }

    let mut cursor = Cursor::new(body);

    let key_name_size = cursor.read_u64::<LittleEndian>()?;
    if key_name_size != 8 {
        return Err(Error::InvalidEncryptedChunk(format!(
            "key name size {key_name_size}, expected 8"
        )));
    }
    let key_name = cursor.read_u64::<LittleEndian>()?;

    let key = keys
        .and_then(|t| t.get(key_name))
        .ok_or(Error::MissingKey(key_name))?;

    let iv_size = cursor.read_u32::<LittleEndian>()?;
    if iv_size != 4 {
        return Err(Error::InvalidEncryptedChunk(format!(
            "IV size {iv_size}, expected 4"
        )));
    }
    let mut iv = [0u8; 4];
    cursor.read_exact(&mut iv)?;

    let cipher = cursor.read_u8()?;
    let ciphertext = &body[cursor.position() as usize..];

    match cipher {
        b'S' => Ok(decrypt_salsa20(ciphertext, key, &iv, chunk_index)?),
        b'A' => Ok(decrypt_arc4(ciphertext, key, &iv, chunk_index)?),
        other => Err(Error::UnsupportedEncryptionType(other)),
    }
}

/// Decode a whole BLTE blob.
///
/// When `expected_ekey` is provided, the blob's identity is verified before
/// any chunk is decoded.
pub fn decode(data: &[u8], expected_ekey: Option<&Md5>, keys: Option<&KeyTable>) -> Result<Vec<u8>> {
    let file = BlteFile::parse(data.to_vec())?;
    if let Some(ekey) = expected_ekey {
        file.verify_key(ekey)?;
    }
    file.decode_all(keys)
}

/// Strictly verify a blob against its ekey without decoding payloads.
///
/// Checks the header MD5 (or whole-blob MD5 for the single-chunk form),
/// every chunk's table MD5, and that no bytes trail the declared end.
pub fn verify(data: &[u8], ekey: &Md5) -> Result<()> {
    let file = BlteFile::parse(data.to_vec())?;
    file.verify_key(ekey)?;

    for index in 0..file.header().chunk_count() {
        file.encoded_chunk(index)?;
    }

    if !file.header().is_single_chunk() && data.len() > file.declared_len() {
        return Err(Error::TrailingData(data.len() - file.declared_len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{ChunkPlan, encode, encode_single};

    #[test]
    fn test_decode_multi_chunk() {
        let plans = vec![
            ChunkPlan::raw(b"hello ".to_vec()),
            ChunkPlan::zlib(b"world".to_vec()),
            ChunkPlan::lz4(b"!".to_vec()),
        ];
        let (blob, ekey) = encode(&plans, None).unwrap();

        let decoded = decode(&blob, Some(&ekey), None).unwrap();
        assert_eq!(decoded, b"hello world!");
    }

    #[test]
    fn test_decode_single_chunk() {
        let (blob, ekey) = encode_single(Mode::Raw, b"hello world").unwrap();
        assert_eq!(decode(&blob, Some(&ekey), None).unwrap(), b"hello world");
    }

    #[test]
    fn test_wrong_ekey_rejected() {
        let (blob, _) = encode(&[ChunkPlan::raw(b"x".to_vec())], None).unwrap();
        let err = decode(&blob, Some(&[0u8; 16]), None).unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                what: "BLTE header",
                ..
            }
        ));
    }

    #[test]
    fn test_tampered_chunk_rejected() {
        let (mut blob, ekey) = encode(&[ChunkPlan::raw(b"payload".to_vec())], None).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;

        let err = decode(&blob, Some(&ekey), None).unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                what: "BLTE chunk",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut blob = b"BLTE\x00\x00\x00\x00".to_vec();
        blob.extend_from_slice(b"Xoops");
        let err = decode(&blob, None, None).unwrap_err();
        assert!(matches!(err, Error::UnknownMode(b'X')));
    }

    #[test]
    fn test_encrypted_chunk_missing_key() {
        let plan = ChunkPlan::encrypted(0xDEADBEEF, [1, 2, 3, 4], Mode::Raw, b"secret".to_vec());
        let mut keys = KeyTable::new();
        keys.insert(0xDEADBEEF, [9u8; 16]);
        let (blob, ekey) = encode(&[plan], Some(&keys)).unwrap();

        let err = decode(&blob, Some(&ekey), None).unwrap_err();
        assert!(matches!(err, Error::MissingKey(0xDEADBEEF)));
    }

    #[test]
    fn test_encrypted_chunk_round_trip() {
        let mut keys = KeyTable::new();
        keys.insert(0xDEADBEEF, [9u8; 16]);

        for inner in [Mode::Raw, Mode::Zlib] {
            let plan = ChunkPlan::encrypted(0xDEADBEEF, [1, 2, 3, 4], inner, b"secret".to_vec());
            let (blob, ekey) = encode(&[plan], Some(&keys)).unwrap();
            let decoded = decode(&blob, Some(&ekey), Some(&keys)).unwrap();
            assert_eq!(decoded, b"secret");
        }
    }

    #[test]
    fn test_verify_detects_trailing_bytes() {
        let (mut blob, ekey) = encode(&[ChunkPlan::raw(b"payload".to_vec())], None).unwrap();
        verify(&blob, &ekey).unwrap();

        blob.extend_from_slice(b"!!");
        let err = verify(&blob, &ekey).unwrap_err();
        assert!(matches!(err, Error::TrailingData(2)));
    }

    #[test]
    fn test_decoded_chunks_restartable() {
        let plans = vec![
            ChunkPlan::raw(b"one".to_vec()),
            ChunkPlan::raw(b"two".to_vec()),
        ];
        let (blob, _) = encode(&plans, None).unwrap();
        let file = BlteFile::parse(blob).unwrap();

        let first: Vec<_> = file
            .decoded_chunks(None)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let second: Vec<_> = file
            .decoded_chunks(None)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
